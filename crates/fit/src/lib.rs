use geom_core::{
    centroid, covariance, orthonormal_basis, principal_axes, Cone, Cylinder, FeatureType,
    GeomError, Plane, Primitive, Sphere, Torus, Vec3,
};
use log::debug;
use nalgebra::{linalg::SVD, DMatrix, DVector};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum EstimateError {
    #[error("{family:?} needs at least {needed} points, got {got}")]
    InsufficientPoints {
        family: FeatureType,
        needed: usize,
        got: usize,
    },
    #[error("candidate set is degenerate: {0}")]
    Degenerate(&'static str),
    #[error("normal equations are ill-conditioned")]
    IllConditioned,
    #[error("refinement produced a non-finite model")]
    NoConvergence,
    #[error(transparent)]
    Geometry(#[from] GeomError),
}

/// A converged model for one candidate subset: the primitive, the
/// root-mean-square of the perpendicular residuals, and the per-point
/// unsigned residuals in input order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Estimate {
    pub primitive: Primitive,
    pub rms: f64,
    pub residuals: Vec<f64>,
}

impl Estimate {
    fn from_primitive(primitive: Primitive, points: &[Vec3]) -> Self {
        let residuals: Vec<f64> = points.iter().map(|p| primitive.distance_to(p)).collect();
        let rms = rms_of(&residuals);
        Self {
            primitive,
            rms,
            residuals,
        }
    }
}

fn rms_of(residuals: &[f64]) -> f64 {
    if residuals.is_empty() {
        return f64::INFINITY;
    }
    (residuals.iter().map(|r| r * r).sum::<f64>() / residuals.len() as f64).sqrt()
}

/// Smallest subset each family can be estimated from.
pub fn min_support(family: FeatureType) -> usize {
    match family {
        FeatureType::Plane => 3,
        FeatureType::Sphere => 4,
        FeatureType::Cylinder => 6,
        FeatureType::Cone => 6,
        FeatureType::Torus => 8,
        FeatureType::Any => 3,
    }
}

/// Fits one concrete family to the candidate subset. `accuracy` is the a
/// priori measurement noise; it scales degeneracy thresholds and the
/// refinement stopping tolerance.
pub fn estimate(
    family: FeatureType,
    points: &[Vec3],
    accuracy: f64,
) -> Result<Estimate, EstimateError> {
    let needed = min_support(family);
    if points.len() < needed {
        return Err(EstimateError::InsufficientPoints {
            family,
            needed,
            got: points.len(),
        });
    }
    match family {
        FeatureType::Plane => estimate_plane(points, accuracy),
        FeatureType::Sphere => estimate_sphere(points, accuracy),
        FeatureType::Cylinder => estimate_cylinder(points, accuracy),
        FeatureType::Cone => estimate_cone(points, accuracy),
        FeatureType::Torus => estimate_torus(points, accuracy),
        FeatureType::Any => Err(EstimateError::Degenerate(
            "`Any` is resolved by the caller, not the estimator",
        )),
    }
}

// --- Plane ----------------------------------------------------------------

/// Orthogonal-distance plane through the covariance eigenbasis; closed form,
/// no iterative refinement needed.
fn estimate_plane(points: &[Vec3], accuracy: f64) -> Result<Estimate, EstimateError> {
    let c = centroid(points);
    let axes = principal_axes(&covariance(points, &c));
    let lateral_spread = (axes.values[1] / points.len() as f64).max(0.0).sqrt();
    if lateral_spread < 0.5 * accuracy {
        return Err(EstimateError::Degenerate("points are nearly collinear"));
    }
    let normal = axes.vectors[0];
    let u = axes.vectors[2].normalize();
    let v = normal.cross(&u);

    let (mut a_min, mut a_max) = (f64::MAX, f64::MIN);
    let (mut b_min, mut b_max) = (f64::MAX, f64::MIN);
    for p in points {
        let w = p - c;
        let a = w.dot(&u);
        let b = w.dot(&v);
        a_min = a_min.min(a);
        a_max = a_max.max(a);
        b_min = b_min.min(b);
        b_max = b_max.max(b);
    }
    let center = c + u * (a_min + a_max) / 2.0 + v * (b_min + b_max) / 2.0;
    let plane = Plane::from_frame(center, u, v, (a_max - a_min) / 2.0, (b_max - b_min) / 2.0);
    Ok(Estimate::from_primitive(Primitive::Plane(plane), points))
}

// --- Sphere ---------------------------------------------------------------

fn estimate_sphere(points: &[Vec3], accuracy: f64) -> Result<Estimate, EstimateError> {
    // Algebraic least squares: || p ||^2 = 2 c . p - (|c|^2 - r^2).
    let mut a = DMatrix::zeros(points.len(), 4);
    let mut b = DVector::zeros(points.len());
    for (i, p) in points.iter().enumerate() {
        a[(i, 0)] = -2.0 * p.x;
        a[(i, 1)] = -2.0 * p.y;
        a[(i, 2)] = -2.0 * p.z;
        a[(i, 3)] = 1.0;
        b[i] = -(p.x * p.x + p.y * p.y + p.z * p.z);
    }
    let svd = SVD::new(a, true, true);
    let solution = svd
        .solve(&b, 1e-12)
        .map_err(|_| EstimateError::IllConditioned)?;
    let center = Vec3::new(solution[0], solution[1], solution[2]);
    let radius_sq = center.dot(&center) - solution[3];
    if radius_sq <= 0.0 {
        return Err(EstimateError::Degenerate("algebraic radius is imaginary"));
    }
    let radius = radius_sq.sqrt();

    let extent = spread(points);
    if radius > 1.0e2 * extent.max(accuracy) {
        return Err(EstimateError::Degenerate(
            "points are coplanar (radius diverges)",
        ));
    }

    let init = DVector::from_vec(vec![center.x, center.y, center.z, radius]);
    let refined = gauss_newton(
        init,
        points.len(),
        |q, out| {
            let c = Vec3::new(q[0], q[1], q[2]);
            for (i, p) in points.iter().enumerate() {
                out[i] = (p - c).norm() - q[3];
            }
        },
        accuracy,
    )?;
    let sphere = Sphere::new(
        Vec3::new(refined[0], refined[1], refined[2]),
        refined[3].abs(),
    )?;
    Ok(Estimate::from_primitive(Primitive::Sphere(sphere), points))
}

// --- Cylinder -------------------------------------------------------------

struct AxisFrame {
    axis: Vec3,
    anchor: Vec3,
    radius: f64,
}

/// One seed frame per principal direction whose projection admits a circle
/// fit. A small patch often supports a plausible circle around the wrong
/// direction, so refinement runs from every frame and the lowest RMS wins.
fn axis_candidates(points: &[Vec3]) -> Vec<AxisFrame> {
    let c = centroid(points);
    let axes = principal_axes(&covariance(points, &c));
    let mut frames = Vec::with_capacity(3);
    for cand in axes.vectors {
        let Some((center2, radius, _)) = projected_circle(points, &c, &cand) else {
            continue;
        };
        let (u, v) = orthonormal_basis(&cand);
        frames.push(AxisFrame {
            axis: cand,
            anchor: c + u * center2.0 + v * center2.1,
            radius,
        });
    }
    frames
}

/// Kasa circle fit of the points projected onto the plane perpendicular to
/// `axis`. Returns in-plane center, radius and the residual variance.
fn projected_circle(points: &[Vec3], origin: &Vec3, axis: &Vec3) -> Option<((f64, f64), f64, f64)> {
    let (u, v) = orthonormal_basis(axis);
    let mut a = DMatrix::zeros(points.len(), 3);
    let mut b = DVector::zeros(points.len());
    for (i, p) in points.iter().enumerate() {
        let w = p - origin;
        let x = w.dot(&u);
        let y = w.dot(&v);
        a[(i, 0)] = 2.0 * x;
        a[(i, 1)] = 2.0 * y;
        a[(i, 2)] = 1.0;
        b[i] = x * x + y * y;
    }
    let svd = SVD::new(a, true, true);
    let sol = svd.solve(&b, 1e-12).ok()?;
    let r_sq = sol[2] + sol[0] * sol[0] + sol[1] * sol[1];
    if !(r_sq > 0.0) || !r_sq.is_finite() {
        return None;
    }
    let radius = r_sq.sqrt();
    let mut var = 0.0;
    for p in points {
        let w = p - origin;
        let x = w.dot(&u) - sol[0];
        let y = w.dot(&v) - sol[1];
        let d = (x * x + y * y).sqrt() - radius;
        var += d * d;
    }
    Some(((sol[0], sol[1]), radius, var / points.len() as f64))
}

fn estimate_cylinder(points: &[Vec3], accuracy: f64) -> Result<Estimate, EstimateError> {
    let mut best: Option<Estimate> = None;
    let mut last_err = EstimateError::Degenerate("no axis direction fits a circle");
    for frame in axis_candidates(points) {
        match cylinder_from_frame(points, &frame, accuracy) {
            Ok(estimate) => {
                if best.as_ref().map_or(true, |b| estimate.rms < b.rms) {
                    best = Some(estimate);
                }
            }
            Err(err) => last_err = err,
        }
    }
    best.ok_or(last_err)
}

fn cylinder_from_frame(
    points: &[Vec3],
    frame: &AxisFrame,
    accuracy: f64,
) -> Result<Estimate, EstimateError> {
    let (theta, phi) = spherical_angles(&frame.axis);
    let anchor = frame.anchor;

    let init = DVector::from_vec(vec![theta, phi, 0.0, 0.0, frame.radius]);
    let refined = gauss_newton(
        init,
        points.len(),
        |q, out| {
            let axis = axis_from_angles(q[0], q[1]);
            let (u, v) = orthonormal_basis(&axis);
            let origin = anchor + u * q[2] + v * q[3];
            for (i, p) in points.iter().enumerate() {
                let w = p - origin;
                let rho = (w - axis * w.dot(&axis)).norm();
                out[i] = rho - q[4];
            }
        },
        accuracy,
    )?;

    let axis = axis_from_angles(refined[0], refined[1]);
    let (u, v) = orthonormal_basis(&axis);
    let origin = anchor + u * refined[2] + v * refined[3];
    let radius = refined[4].abs();

    let (t_min, t_max) = axial_range(points, &origin, &axis);
    if t_max - t_min < 2.0 * accuracy {
        return Err(EstimateError::Degenerate(
            "points do not span the axis direction",
        ));
    }
    let cylinder = Cylinder::new(origin + axis * t_min, origin + axis * t_max, radius)?;
    Ok(Estimate::from_primitive(
        Primitive::Cylinder(cylinder),
        points,
    ))
}

// --- Cone -----------------------------------------------------------------

/// The cone is refined as `(axis angles, in-plane anchor offset, radius at
/// the anchor plane, radius slope along the axis)`. The slope form stays
/// finite as the half-angle approaches zero, where the apex runs off to
/// infinity; the near-cylinder case is left to smart conversion.
fn estimate_cone(points: &[Vec3], accuracy: f64) -> Result<Estimate, EstimateError> {
    let mut best: Option<Estimate> = None;
    let mut last_err = EstimateError::Degenerate("no axis direction fits a circle");
    for frame in axis_candidates(points) {
        match cone_from_frame(points, &frame, accuracy) {
            Ok(estimate) => {
                if best.as_ref().map_or(true, |b| estimate.rms < b.rms) {
                    best = Some(estimate);
                }
            }
            Err(err) => last_err = err,
        }
    }
    best.ok_or(last_err)
}

fn cone_from_frame(
    points: &[Vec3],
    frame: &AxisFrame,
    accuracy: f64,
) -> Result<Estimate, EstimateError> {
    let anchor = frame.anchor;
    let (theta, phi) = spherical_angles(&frame.axis);

    // Linear regression of radial distance against axial position seeds the
    // slope.
    let mut sum_t = 0.0;
    let mut sum_r = 0.0;
    let mut sum_tt = 0.0;
    let mut sum_tr = 0.0;
    for p in points {
        let w = p - anchor;
        let t = w.dot(&frame.axis);
        let rho = (w - frame.axis * t).norm();
        sum_t += t;
        sum_r += rho;
        sum_tt += t * t;
        sum_tr += t * rho;
    }
    let n = points.len() as f64;
    let denom = n * sum_tt - sum_t * sum_t;
    if denom.abs() < 1e-12 {
        return Err(EstimateError::Degenerate(
            "points do not span the axis direction",
        ));
    }
    let slope = (n * sum_tr - sum_t * sum_r) / denom;
    let r0 = (sum_r - slope * sum_t) / n;

    let init = DVector::from_vec(vec![theta, phi, 0.0, 0.0, r0, slope]);
    let refined = gauss_newton(
        init,
        points.len(),
        |q, out| {
            let axis = axis_from_angles(q[0], q[1]);
            let (u, v) = orthonormal_basis(&axis);
            let origin = anchor + u * q[2] + v * q[3];
            let scale = (1.0 + q[5] * q[5]).sqrt();
            for (i, p) in points.iter().enumerate() {
                let w = p - origin;
                let t = w.dot(&axis);
                let rho = (w - axis * t).norm();
                out[i] = (rho - (q[4] + q[5] * t)) / scale;
            }
        },
        accuracy,
    )?;

    let axis = axis_from_angles(refined[0], refined[1]);
    let (u, v) = orthonormal_basis(&axis);
    let origin = anchor + u * refined[2] + v * refined[3];
    let (r0, slope) = (refined[4], refined[5]);

    let (t_min, t_max) = axial_range(points, &origin, &axis);
    if t_max - t_min < 2.0 * accuracy {
        return Err(EstimateError::Degenerate(
            "points do not span the axis direction",
        ));
    }
    let r_bottom = r0 + slope * t_min;
    let r_top = r0 + slope * t_max;
    if r_bottom < 0.0 || r_top < 0.0 {
        return Err(EstimateError::Degenerate("apex falls inside the sample"));
    }
    let cone = Cone::new(
        origin + axis * t_min,
        origin + axis * t_max,
        r_bottom,
        r_top,
    )?;
    Ok(Estimate::from_primitive(Primitive::Cone(cone), points))
}

// --- Torus ----------------------------------------------------------------

fn estimate_torus(points: &[Vec3], accuracy: f64) -> Result<Estimate, EstimateError> {
    let c = centroid(points);
    let axes = principal_axes(&covariance(points, &c));

    // Seed from whichever principal direction explains the ring best.
    let mut best: Option<(Vec3, f64, f64, f64)> = None;
    for cand in axes.vectors {
        let (mean_r, tube_r, err) = ring_profile(points, &c, &cand);
        if best.as_ref().map_or(true, |b| err < b.3) {
            best = Some((cand, mean_r, tube_r, err));
        }
    }
    let (axis0, mean0, tube0, _) =
        best.ok_or(EstimateError::Degenerate("no ring axis candidate"))?;
    let (theta, phi) = spherical_angles(&axis0);

    let init = DVector::from_vec(vec![theta, phi, c.x, c.y, c.z, mean0, tube0]);
    let refined = gauss_newton(
        init,
        points.len(),
        |q, out| {
            let axis = axis_from_angles(q[0], q[1]);
            let center = Vec3::new(q[2], q[3], q[4]);
            for (i, p) in points.iter().enumerate() {
                let w = p - center;
                let z = w.dot(&axis);
                let rho = (w - axis * z).norm();
                out[i] = ((rho - q[5]).powi(2) + z * z).sqrt() - q[6];
            }
        },
        accuracy,
    )?;

    let axis = axis_from_angles(refined[0], refined[1]);
    let center = Vec3::new(refined[2], refined[3], refined[4]);
    let torus = Torus::new(center, axis, refined[5].abs(), refined[6].abs())?;
    Ok(Estimate::from_primitive(Primitive::Torus(torus), points))
}

/// Mean ring radius, mean tube radius and the mean squared tube deviation
/// for a candidate revolution axis through `center`.
fn ring_profile(points: &[Vec3], center: &Vec3, axis: &Vec3) -> (f64, f64, f64) {
    let mut sum_rho = 0.0;
    for p in points {
        let w = p - center;
        let z = w.dot(axis);
        sum_rho += (w - axis * z).norm();
    }
    let mean_r = sum_rho / points.len() as f64;
    let mut sum_tube = 0.0;
    for p in points {
        let w = p - center;
        let z = w.dot(axis);
        let rho = (w - axis * z).norm();
        sum_tube += ((rho - mean_r).powi(2) + z * z).sqrt();
    }
    let tube_r = sum_tube / points.len() as f64;
    let mut err = 0.0;
    for p in points {
        let w = p - center;
        let z = w.dot(axis);
        let rho = (w - axis * z).norm();
        let d = ((rho - mean_r).powi(2) + z * z).sqrt() - tube_r;
        err += d * d;
    }
    (mean_r, tube_r, err / points.len() as f64)
}

// --- Shared numerics ------------------------------------------------------

fn spherical_angles(axis: &Vec3) -> (f64, f64) {
    let theta = axis.z.clamp(-1.0, 1.0).acos();
    let phi = axis.y.atan2(axis.x);
    (theta, phi)
}

fn axis_from_angles(theta: f64, phi: f64) -> Vec3 {
    Vec3::new(
        theta.sin() * phi.cos(),
        theta.sin() * phi.sin(),
        theta.cos(),
    )
}

fn axial_range(points: &[Vec3], origin: &Vec3, axis: &Vec3) -> (f64, f64) {
    let mut t_min = f64::MAX;
    let mut t_max = f64::MIN;
    for p in points {
        let t = (p - origin).dot(axis);
        t_min = t_min.min(t);
        t_max = t_max.max(t);
    }
    (t_min, t_max)
}

/// Diagonal of the axis-aligned bounds, a cheap extent proxy.
fn spread(points: &[Vec3]) -> f64 {
    let mut lo = Vec3::repeat(f64::MAX);
    let mut hi = Vec3::repeat(f64::MIN);
    for p in points {
        lo = lo.inf(p);
        hi = hi.sup(p);
    }
    (hi - lo).norm()
}

const GN_MAX_ITERATIONS: usize = 16;
const GN_LAMBDA_INIT: f64 = 1e-3;
const GN_LAMBDA_MAX: f64 = 1e8;

/// Damped Gauss-Newton (Levenberg style) over a numeric Jacobian. The
/// residual closure fills `out` (length `m`) for a given parameter vector.
/// Fails with `IllConditioned` when no damped step can be taken at all, and
/// with `NoConvergence` when the model leaves the finite domain.
fn gauss_newton<F>(
    mut params: DVector<f64>,
    m: usize,
    residual: F,
    accuracy: f64,
) -> Result<DVector<f64>, EstimateError>
where
    F: Fn(&DVector<f64>, &mut DVector<f64>),
{
    let n = params.len();
    let step_tol = (1e-3 * accuracy).max(1e-12);
    let mut r = DVector::zeros(m);
    let mut r_next = DVector::zeros(m);
    residual(&params, &mut r);
    let mut cost = r.norm_squared();
    if !cost.is_finite() {
        return Err(EstimateError::NoConvergence);
    }
    let mut lambda = GN_LAMBDA_INIT;

    for iteration in 0..GN_MAX_ITERATIONS {
        let jac = numeric_jacobian(&residual, &params, m);
        let jtj = jac.transpose() * &jac;
        let jtr = jac.transpose() * &r;

        let mut stepped = false;
        while lambda <= GN_LAMBDA_MAX {
            let mut damped = jtj.clone();
            for d in 0..n {
                damped[(d, d)] += lambda * jtj[(d, d)].max(1e-12);
            }
            let Some(chol) = damped.cholesky() else {
                lambda *= 10.0;
                continue;
            };
            let delta = chol.solve(&(-&jtr));
            let candidate = &params + &delta;
            residual(&candidate, &mut r_next);
            let next_cost = r_next.norm_squared();
            if next_cost.is_finite() && next_cost <= cost {
                let done = delta.norm() <= step_tol * (1.0 + params.norm());
                params = candidate;
                std::mem::swap(&mut r, &mut r_next);
                cost = next_cost;
                lambda = (lambda * 0.3).max(1e-10);
                stepped = true;
                if done {
                    return Ok(params);
                }
                break;
            }
            lambda *= 10.0;
        }
        if !stepped {
            if iteration == 0 {
                debug!("gauss-newton: no admissible step from the initial model");
                return Err(EstimateError::IllConditioned);
            }
            // Stalled after making progress: accept the local minimum.
            break;
        }
    }
    if params.iter().all(|p| p.is_finite()) {
        Ok(params)
    } else {
        Err(EstimateError::NoConvergence)
    }
}

fn numeric_jacobian<F>(residual: &F, params: &DVector<f64>, m: usize) -> DMatrix<f64>
where
    F: Fn(&DVector<f64>, &mut DVector<f64>),
{
    let n = params.len();
    let mut jac = DMatrix::zeros(m, n);
    let mut plus = DVector::zeros(m);
    let mut minus = DVector::zeros(m);
    for c in 0..n {
        let h = 1e-6 * (1.0 + params[c].abs());
        let mut fwd = params.clone();
        fwd[c] += h;
        let mut bwd = params.clone();
        bwd[c] -= h;
        residual(&fwd, &mut plus);
        residual(&bwd, &mut minus);
        for row in 0..m {
            jac[(row, c)] = (plus[row] - minus[row]) / (2.0 * h);
        }
    }
    jac
}
