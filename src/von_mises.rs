//! Von Mises densities and samplers, on the circle and on the 2-sphere.
//!
//! Densities are written in terms of `exp(kappa * (cos - 1))` so that large
//! concentrations do not overflow.

use crate::vector::Vec3;
use rand::Rng;
use rand_distr::{StandardNormal, UnitCircle};
use std::f64::consts::PI;

/// Below this the distributions are treated as uniform.
const MIN_KAPPA: f64 = 1e-8;

/// Above this the circular sampler switches to a wrapped normal, which is
/// indistinguishable at that concentration and avoids cancellation in the
/// rejection sampler.
const NORMAL_APPROX_KAPPA: f64 = 1e4;

/// Exponentially scaled modified Bessel function of the first kind, order
/// zero: `exp(-x) * I0(x)` for `x >= 0`. Abramowitz & Stegun 9.8.1 / 9.8.2.
pub fn bessel_i0e(x: f64) -> f64 {
    let x = x.abs();
    if x <= 3.75 {
        let t = (x / 3.75).powi(2);
        let i0 = 1.0
            + t * (3.5156229
                + t * (3.0899424
                    + t * (1.2067492 + t * (0.2659732 + t * (0.0360768 + t * 0.0045813)))));
        i0 * (-x).exp()
    } else {
        let t = 3.75 / x;
        let p = 0.39894228
            + t * (0.01328592
                + t * (0.00225319
                    + t * (-0.00157565
                        + t * (0.00916281
                            + t * (-0.02057706
                                + t * (0.02635537 + t * (-0.01647633 + t * 0.00392377)))))));
        p / x.sqrt()
    }
}

/// Density of the circular von Mises distribution at angular distance
/// `delta` from its mean.
pub fn circular_density(delta: f64, kappa: f64) -> f64 {
    if kappa < MIN_KAPPA {
        return circular_uniform();
    }
    (kappa * (delta.cos() - 1.0)).exp() / (2.0 * PI * bessel_i0e(kappa))
}

/// Density of the uniform distribution on the circle.
pub fn circular_uniform() -> f64 {
    1.0 / (2.0 * PI)
}

/// Density of the von Mises-Fisher distribution on the 2-sphere, for unit
/// vectors `x` and `mean`.
pub fn spherical_density(x: &Vec3, mean: &Vec3, kappa: f64) -> f64 {
    if kappa < MIN_KAPPA {
        return spherical_uniform();
    }
    let norm = kappa / (2.0 * PI * (1.0 - (-2.0 * kappa).exp()));
    norm * (kappa * (x.dot(mean) - 1.0)).exp()
}

/// Density of the uniform distribution on the 2-sphere.
pub fn spherical_uniform() -> f64 {
    1.0 / (4.0 * PI)
}

/// Draws an angle from a von Mises distribution centred on zero, using the
/// Best & Fisher rejection sampler.
pub fn sample_circular<R: Rng + ?Sized>(rng: &mut R, kappa: f64) -> f64 {
    if kappa < MIN_KAPPA {
        return rng.gen_range(-PI..PI);
    }
    if kappa > NORMAL_APPROX_KAPPA {
        return rng.sample::<f64, _>(StandardNormal) / kappa.sqrt();
    }

    let tau = 1.0 + (1.0 + 4.0 * kappa * kappa).sqrt();
    let rho = (tau - (2.0 * tau).sqrt()) / (2.0 * kappa);
    let r = (1.0 + rho * rho) / (2.0 * rho);

    loop {
        let u1: f64 = rng.gen();
        let u2: f64 = rng.gen();
        let z = (PI * u1).cos();
        let f = (1.0 + r * z) / (r + z);
        let c = kappa * (r - f);
        if c * (2.0 - c) - u2 > 0.0 || (c / u2).ln() + 1.0 - c >= 0.0 {
            let angle = f.clamp(-1.0, 1.0).acos();
            return if rng.gen::<bool>() { angle } else { -angle };
        }
    }
}

/// Draws a unit vector from a von Mises-Fisher distribution on the 2-sphere
/// centred on the unit vector `mean` (Wood's method, exact in 3D).
pub fn sample_spherical<R: Rng + ?Sized>(rng: &mut R, mean: &Vec3, kappa: f64) -> Vec3 {
    let u: f64 = rng.gen();
    // cosine of the angle to the mean
    let w = if kappa < MIN_KAPPA {
        2.0 * u - 1.0
    } else {
        (1.0 + (u + (1.0 - u) * (-2.0 * kappa).exp()).ln() / kappa).clamp(-1.0, 1.0)
    };
    let [cos_psi, sin_psi]: [f64; 2] = rng.sample(UnitCircle);
    let (a, b) = tangent_basis(mean);
    let s = (1.0 - w * w).max(0.0).sqrt();
    *mean * w + (a * cos_psi + b * sin_psi) * s
}

/// Two unit vectors completing `n` to an orthonormal basis.
fn tangent_basis(n: &Vec3) -> (Vec3, Vec3) {
    let helper = if n.x.abs() < 0.9 {
        Vec3::new(1.0, 0.0, 0.0)
    } else {
        Vec3::new(0.0, 1.0, 0.0)
    };
    let a = n.cross(&helper).normalized().unwrap_or(Vec3::new(0.0, 0.0, 1.0));
    let b = n.cross(&a);
    (a, b)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn bessel_reference_values() {
        // I0(1) = 1.2660658, I0(10) = 2815.7166
        assert!((bessel_i0e(1.0) * 1f64.exp() - 1.2660658).abs() < 1e-6);
        assert!((bessel_i0e(10.0) * 10f64.exp() - 2815.7166).abs() / 2815.7166 < 1e-5);
        assert!((bessel_i0e(0.0) - 1.0).abs() < 1e-12);
    }

    #[test]
    fn circular_density_integrates_to_one() {
        for kappa in [0.0, 0.5, 4.0, 50.0] {
            let n = 20_000;
            let step = 2.0 * PI / n as f64;
            let total: f64 = (0..n)
                .map(|i| circular_density(-PI + step * i as f64, kappa) * step)
                .sum();
            assert!((total - 1.0).abs() < 1e-3, "kappa {} integrates to {}", kappa, total);
        }
    }

    #[test]
    fn spherical_density_integrates_to_one() {
        let mean = Vec3::new(0.0, 0.0, 1.0);
        for kappa in [0.0, 2.0, 40.0] {
            // integrate over the polar angle, azimuth is symmetric
            let n = 20_000;
            let step = PI / n as f64;
            let total: f64 = (0..n)
                .map(|i| {
                    let phi = step * (i as f64 + 0.5);
                    let x = Vec3::from_spherical(0.0, phi);
                    spherical_density(&x, &mean, kappa) * 2.0 * PI * phi.sin() * step
                })
                .sum();
            assert!((total - 1.0).abs() < 1e-3, "kappa {} integrates to {}", kappa, total);
        }
    }

    #[test]
    fn circular_samples_concentrate() {
        let mut rng = StdRng::seed_from_u64(7);
        let kappa = 40.0;
        let n = 5_000;
        let samples: Vec<f64> = (0..n).map(|_| sample_circular(&mut rng, kappa)).collect();
        let mean = samples.iter().sum::<f64>() / n as f64;
        let var = samples.iter().map(|s| (s - mean).powi(2)).sum::<f64>() / n as f64;
        assert!(mean.abs() < 0.02);
        // for large kappa the variance is close to 1 / kappa
        assert!((var - 1.0 / kappa).abs() < 0.005, "variance {}", var);
    }

    #[test]
    fn very_concentrated_circular_samples() {
        let mut rng = StdRng::seed_from_u64(5);
        let kappa = 1e6;
        let n = 5_000;
        let samples: Vec<f64> = (0..n).map(|_| sample_circular(&mut rng, kappa)).collect();
        let var = samples.iter().map(|s| s * s).sum::<f64>() / n as f64;
        assert!(samples.iter().all(|s| s.abs() < 0.01));
        assert!((var * kappa - 1.0).abs() < 0.1, "scaled variance {}", var * kappa);
    }

    #[test]
    fn circular_samples_uniform_at_zero_kappa() {
        let mut rng = StdRng::seed_from_u64(3);
        assert!((0..1000)
            .map(|_| sample_circular(&mut rng, 0.0))
            .all(|a| (-PI..PI).contains(&a)));
    }

    #[test]
    fn spherical_samples_are_unit_and_concentrated() {
        let mut rng = StdRng::seed_from_u64(11);
        let mean = Vec3::new(1.0, 2.0, -0.5).normalized().unwrap();
        let kappa = 50.0;
        let n = 5_000;
        let mut mean_cos = 0.0;
        for _ in 0..n {
            let s = sample_spherical(&mut rng, &mean, kappa);
            assert!((s.norm() - 1.0).abs() < 1e-9);
            mean_cos += s.dot(&mean);
        }
        mean_cos /= n as f64;
        // E[cos] = coth(kappa) - 1 / kappa
        let expected = 1.0 / kappa.tanh() - 1.0 / kappa;
        assert!((mean_cos - expected).abs() < 0.005, "mean cosine {}", mean_cos);
    }
}
