//! Butcher tableaus of the explicit Runge–Kutta methods.
//!
//! Notation is as in (ref 1): stage `i` is evaluated at `t + c_i h` with
//! input `y + h Σ_j a_ij k_j`, and the step result is `y + h Σ_i b_i k_i`.
//!
//! # References
//!
//! 1. E. Hairer, S. P. Norsett G. Wanner, "Solving Ordinary Differential
//!    Equations I: Nonstiff Problems", Sec. II.1.

use lazy_static::lazy_static;
use ndarray::prelude::*;

pub trait RKMethod {
    /// Order of the solution used to advance the state.
    const ORDER: usize;

    /// Number of stages in the method.
    const NUM_STAGES: usize;

    /// Coefficients for incrementing time for consecutive RK stages, length
    /// `NUM_STAGES - 1`.
    ///
    /// The value for the first stage is always zero, so it is not included.
    fn c() -> ArrayView1<'static, f64>;

    /// Coefficients for combining previous RK stages to compute the next
    /// stage, length `NUM_STAGES - 1`.
    ///
    /// For explicit methods the coefficients above the main diagonal are
    /// zeros, so `a` is stored as a list of arrays of increasing lengths. The
    /// first stage is always just `f`, thus no coefficients for it are
    /// required.
    fn a() -> &'static [ArrayView1<'static, f64>];

    /// Coefficients for combining RK stages for computing the final
    /// prediction, length `NUM_STAGES`.
    fn b() -> ArrayView1<'static, f64>;

    /// Coefficients for estimating the local truncation error per unit step
    /// length, length `NUM_STAGES`, or `None` for methods without an
    /// embedded formula.
    ///
    /// They are the difference between the `b`'s of the higher- and
    /// lower-order formulas.
    fn e() -> Option<ArrayView1<'static, f64>> {
        None
    }
}

/// A method with an embedded lower-order formula, suitable for adaptive step
/// size control.
pub trait EmbeddedRKMethod: RKMethod {
    /// Order of the embedded formula; the error estimate is
    /// `O(h^(ERROR_ORDER + 1))`.
    const ERROR_ORDER: usize;

    /// Weights of the embedded lower-order formula, length `NUM_STAGES`.
    fn b_low() -> ArrayView1<'static, f64>;

    /// Error weights, `b() - b_low()`.
    fn error_weights() -> ArrayView1<'static, f64> {
        match Self::e() {
            Some(e) => e,
            None => unreachable!("embedded method without error weights"),
        }
    }
}

/// The classic fourth-order Runge–Kutta method.
pub struct RK4;

impl RKMethod for RK4 {
    const ORDER: usize = 4;

    const NUM_STAGES: usize = 4;

    fn c() -> ArrayView1<'static, f64> {
        aview1(&[1./2., 1./2., 1.])
    }

    fn a() -> &'static [ArrayView1<'static, f64>] {
        lazy_static! {
            static ref A: [ArrayView1<'static, f64>; 4 - 1] = [
                aview1(&[1./2.]),
                aview1(&[0., 1./2.]),
                aview1(&[0., 0., 1.]),
            ];
        }
        &*A
    }

    fn b() -> ArrayView1<'static, f64> {
        aview1(&[1./6., 1./3., 1./3., 1./6.])
    }
}

/// Ten-stage explicit Runge–Kutta method of nominal order 8.
///
/// A fixed-step method: it has no embedded formula, so the step size is
/// entirely up to the caller.
pub struct RK8;

impl RKMethod for RK8 {
    const ORDER: usize = 8;

    const NUM_STAGES: usize = 10;

    fn c() -> ArrayView1<'static, f64> {
        aview1(&[4./27., 2./9., 1./3., 1./2., 2./3., 1./6., 1., 5./6., 1.])
    }

    fn a() -> &'static [ArrayView1<'static, f64>] {
        lazy_static! {
            static ref A: [ArrayView1<'static, f64>; 10 - 1] = [
                aview1(&[4./27.]),
                aview1(&[1./18., 3./18.]),
                aview1(&[1./12., 0., 3./12.]),
                aview1(&[1./8., 0., 0., 3./8.]),
                aview1(&[13./54., 0., -27./54., 42./54., 8./54.]),
                aview1(&[389./4320., 0., -54./4320., 966./4320., -824./4320., 243./4320.]),
                aview1(&[-231./20., 0., 81./20., -1164./20., 656./20., -122./20., 800./20.]),
                aview1(&[-127./288., 0., 18./288., -678./288., 456./288., -9./288., 576./288.,
                         4./288.]),
                aview1(&[1481./820., 0., -81./820., 7104./820., -3376./820., 72./820.,
                         -5040./820., -60./820., 720./820.]),
            ];
        }
        &*A
    }

    fn b() -> ArrayView1<'static, f64> {
        aview1(&[41./840., 0., 0., 27./840., 272./840., 27./840., 216./840., 0., 216./840.,
                 41./840.])
    }
}

/// Explicit Runge–Kutta method of order 5(4).
///
/// The Cash-Karp pair of formulas is used (ref 1). The error is controlled
/// assuming 4th order accuracy, but steps are taken using the 5th order
/// accurate formula (local extrapolation is done).
///
/// # References
///
/// 1. J. R. Cash, A. H. Karp, "A variable order Runge-Kutta method for
///    initial value problems with rapidly varying right-hand sides", ACM
///    Transactions on Mathematical Software, Vol. 16, No. 3, pp. 201-222,
///    1990.
pub struct RKCK;

impl RKMethod for RKCK {
    const ORDER: usize = 5;

    const NUM_STAGES: usize = 6;

    fn c() -> ArrayView1<'static, f64> {
        aview1(&[1./5., 3./10., 3./5., 1., 7./8.])
    }

    fn a() -> &'static [ArrayView1<'static, f64>] {
        lazy_static! {
            static ref A: [ArrayView1<'static, f64>; 6 - 1] = [
                aview1(&[1./5.]),
                aview1(&[3./40., 9./40.]),
                aview1(&[3./10., -9./10., 6./5.]),
                aview1(&[-11./54., 5./2., -70./27., 35./27.]),
                aview1(&[1631./55296., 175./512., 575./13824., 44275./110592., 253./4096.]),
            ];
        }
        &*A
    }

    fn b() -> ArrayView1<'static, f64> {
        aview1(&[37./378., 0., 250./621., 125./594., 0., 512./1771.])
    }

    fn e() -> Option<ArrayView1<'static, f64>> {
        Some(aview1(&[
            37./378. - 2825./27648.,
            0.,
            250./621. - 18575./48384.,
            125./594. - 13525./55296.,
            -277./14336.,
            512./1771. - 1./4.,
        ]))
    }
}

impl EmbeddedRKMethod for RKCK {
    const ERROR_ORDER: usize = 4;

    fn b_low() -> ArrayView1<'static, f64> {
        aview1(&[2825./27648., 0., 18575./48384., 13525./55296., 277./14336., 1./4.])
    }
}

/// Runge–Kutta–Fehlberg method of order 4(5).
///
/// Steps are taken with the 5th order formula; the 4th order formula is only
/// used for the error estimate.
///
/// # References
///
/// 1. E. Fehlberg, "Low-order classical Runge-Kutta formulas with stepsize
///    control and their application to some heat transfer problems", NASA
///    TR R-315, 1969.
pub struct RKF45;

impl RKMethod for RKF45 {
    const ORDER: usize = 5;

    const NUM_STAGES: usize = 6;

    fn c() -> ArrayView1<'static, f64> {
        aview1(&[1./4., 3./8., 12./13., 1., 1./2.])
    }

    fn a() -> &'static [ArrayView1<'static, f64>] {
        lazy_static! {
            static ref A: [ArrayView1<'static, f64>; 6 - 1] = [
                aview1(&[1./4.]),
                aview1(&[3./32., 9./32.]),
                aview1(&[1932./2197., -7200./2197., 7296./2197.]),
                aview1(&[439./216., -8., 3680./513., -845./4104.]),
                aview1(&[-8./27., 2., -3544./2565., 1859./4104., -11./40.]),
            ];
        }
        &*A
    }

    fn b() -> ArrayView1<'static, f64> {
        aview1(&[16./135., 0., 6656./12825., 28561./56430., -9./50., 2./55.])
    }

    fn e() -> Option<ArrayView1<'static, f64>> {
        Some(aview1(&[1./360., 0., -128./4275., -2197./75240., 1./50., 2./55.]))
    }
}

impl EmbeddedRKMethod for RKF45 {
    const ERROR_ORDER: usize = 4;

    fn b_low() -> ArrayView1<'static, f64> {
        aview1(&[25./216., 0., 1408./2565., 2197./4104., -1./5., 0.])
    }
}

/// Runge–Kutta–Fehlberg method of order 7(8), 13 stages.
///
/// Steps are taken with the 8th order formula.
///
/// # References
///
/// 1. E. Fehlberg, "Classical Fifth-, Sixth-, Seventh-, and Eighth-Order
///    Runge-Kutta Formulas with Stepsize Control", NASA TR R-287, 1968.
pub struct RKF78;

impl RKMethod for RKF78 {
    const ORDER: usize = 8;

    const NUM_STAGES: usize = 13;

    fn c() -> ArrayView1<'static, f64> {
        aview1(&[2./27., 1./9., 1./6., 5./12., 1./2., 5./6., 1./6., 2./3., 1./3., 1., 0., 1.])
    }

    fn a() -> &'static [ArrayView1<'static, f64>] {
        lazy_static! {
            static ref A: [ArrayView1<'static, f64>; 13 - 1] = [
                aview1(&[2./27.]),
                aview1(&[1./36., 1./12.]),
                aview1(&[1./24., 0., 1./8.]),
                aview1(&[5./12., 0., -25./16., 25./16.]),
                aview1(&[1./20., 0., 0., 1./4., 1./5.]),
                aview1(&[-25./108., 0., 0., 125./108., -65./27., 125./54.]),
                aview1(&[31./300., 0., 0., 0., 61./225., -2./9., 13./900.]),
                aview1(&[2., 0., 0., -53./6., 704./45., -107./9., 67./90., 3.]),
                aview1(&[-91./108., 0., 0., 23./108., -976./135., 311./54., -19./60., 17./6.,
                         -1./12.]),
                aview1(&[2383./4100., 0., 0., -341./164., 4496./1025., -301./82., 2133./4100.,
                         45./82., 45./164., 18./41.]),
                aview1(&[3./205., 0., 0., 0., 0., -6./41., -3./205., -3./41., 3./41., 6./41.,
                         0.]),
                aview1(&[-1777./4100., 0., 0., -341./164., 4496./1025., -289./82., 2193./4100.,
                         51./82., 33./164., 12./41., 0., 1.]),
            ];
        }
        &*A
    }

    fn b() -> ArrayView1<'static, f64> {
        aview1(&[0., 0., 0., 0., 0., 34./105., 9./35., 9./35., 9./280., 9./280., 0., 41./840.,
                 41./840.])
    }

    fn e() -> Option<ArrayView1<'static, f64>> {
        Some(aview1(&[-41./840., 0., 0., 0., 0., 0., 0., 0., 0., 0., -41./840., 41./840.,
                      41./840.]))
    }
}

impl EmbeddedRKMethod for RKF78 {
    const ERROR_ORDER: usize = 7;

    fn b_low() -> ArrayView1<'static, f64> {
        aview1(&[41./840., 0., 0., 0., 0., 34./105., 9./35., 9./35., 9./280., 9./280., 41./840.,
                 0., 0.])
    }
}

/// Explicit Runge–Kutta method of order 6(5) with 8 stages.
///
/// Fehlberg's pair (ref 1). Steps are taken with the 6th order formula.
///
/// # References
///
/// 1. E. Fehlberg, "Classical Fifth-, Sixth-, Seventh-, and Eighth-Order
///    Runge-Kutta Formulas with Stepsize Control", NASA TR R-287, 1968.
pub struct RKF56;

impl RKMethod for RKF56 {
    const ORDER: usize = 6;

    const NUM_STAGES: usize = 8;

    fn c() -> ArrayView1<'static, f64> {
        aview1(&[1./6., 4./15., 2./3., 4./5., 1., 0., 1.])
    }

    fn a() -> &'static [ArrayView1<'static, f64>] {
        lazy_static! {
            static ref A: [ArrayView1<'static, f64>; 8 - 1] = [
                aview1(&[1./6.]),
                aview1(&[4./75., 16./75.]),
                aview1(&[5./6., -8./3., 5./2.]),
                aview1(&[-8./5., 144./25., -4., 16./25.]),
                aview1(&[361./320., -18./5., 407./128., -11./80., 55./128.]),
                aview1(&[-11./640., 0., 11./256., -11./160., 11./256., 0.]),
                aview1(&[93./640., -18./5., 803./256., -11./160., 99./256., 0., 1.]),
            ];
        }
        &*A
    }

    fn b() -> ArrayView1<'static, f64> {
        aview1(&[7./1408., 0., 1125./2816., 9./32., 125./768., 0., 5./66., 5./66.])
    }

    fn e() -> Option<ArrayView1<'static, f64>> {
        Some(aview1(&[-5./66., 0., 0., 0., 0., -5./66., 5./66., 5./66.]))
    }
}

impl EmbeddedRKMethod for RKF56 {
    const ERROR_ORDER: usize = 5;

    fn b_low() -> ArrayView1<'static, f64> {
        aview1(&[31./384., 0., 1125./2816., 9./32., 125./768., 5./66., 0., 0.])
    }
}

lazy_static! {
    static ref SQRT_21: f64 = 21f64.sqrt();
    static ref RKV8_C: Array1<f64> = {
        let s = *SQRT_21;
        let (c1, c2, c3) = (1. / 2., (7. - s) / 14., (7. + s) / 14.);
        array![c1, c1, c2, c2, c1, c3, c3, c1, c2, 1.]
    };
    static ref RKV8_A: Vec<Array1<f64>> = {
        let s = *SQRT_21;
        vec![
            array![1. / 2.],
            array![1. / 4., 1. / 4.],
            array![1. / 7., (-7. + 3. * s) / 98., (21. - 5. * s) / 49.],
            array![(11. - s) / 84., 0., (18. - 4. * s) / 63., (21. + s) / 252.],
            array![(5. - s) / 48., 0., (9. - s) / 36., (-231. - 14. * s) / 360.,
                   (63. + 7. * s) / 80.],
            array![(10. + s) / 42., 0., (-432. - 92. * s) / 315., (633. + 145. * s) / 90.,
                   (-504. - 115. * s) / 70., (63. + 13. * s) / 35.],
            array![1. / 14., 0., 0., 0., (14. + 3. * s) / 126., (13. + 3. * s) / 63., 1. / 9.],
            array![1. / 32., 0., 0., 0., (91. + 21. * s) / 576., 11. / 72.,
                   (-385. + 75. * s) / 1152., (63. - 13. * s) / 128.],
            array![1. / 14., 0., 0., 0., 1. / 9., (-733. + 147. * s) / 2205.,
                   (515. - 111. * s) / 504., (-51. + 11. * s) / 56., (132. - 28. * s) / 245.],
            array![0., 0., 0., 0., (-42. - 7. * s) / 18., (-18. - 28. * s) / 45.,
                   (-273. + 53. * s) / 72., (301. - 53. * s) / 72., (28. + 28. * s) / 45.,
                   (49. + 7. * s) / 18.],
        ]
    };
    static ref RKV8_A_VIEWS: Vec<ArrayView1<'static, f64>> =
        RKV8_A.iter().map(|row| row.view()).collect();
}

/// Cooper–Verner eleven-stage method of order 8.
///
/// Fixed-step only. Its coefficients involve `sqrt(21)`, so they are computed
/// once on first use.
///
/// # References
///
/// 1. G. J. Cooper, J. H. Verner, "Some Explicit Runge-Kutta Methods of High
///    Order", SIAM Journal on Numerical Analysis, Vol. 9, No. 3, 1972.
pub struct RKV8;

impl RKMethod for RKV8 {
    const ORDER: usize = 8;

    const NUM_STAGES: usize = 11;

    fn c() -> ArrayView1<'static, f64> {
        RKV8_C.view()
    }

    fn a() -> &'static [ArrayView1<'static, f64>] {
        &RKV8_A_VIEWS[..]
    }

    fn b() -> ArrayView1<'static, f64> {
        aview1(&[9./180., 0., 0., 0., 0., 0., 0., 49./180., 64./180., 49./180., 9./180.])
    }
}
