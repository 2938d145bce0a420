use std::{
    fs::File,
    path::{Path, PathBuf},
};

use anyhow::{bail, Context, Result};
use clap::{Parser, ValueEnum};
use engine::{Config, ConversionOptions, FitResult, SearchLevel, Session};
use geom_core::{FeatureType, Primitive, Vec3};
use log::info;
use serde::Serialize;

#[derive(Debug, Clone, Copy, ValueEnum, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
enum Feature {
    Any,
    Plane,
    Sphere,
    Cylinder,
    Cone,
    Torus,
}

impl From<Feature> for FeatureType {
    fn from(feature: Feature) -> Self {
        match feature {
            Feature::Any => FeatureType::Any,
            Feature::Plane => FeatureType::Plane,
            Feature::Sphere => FeatureType::Sphere,
            Feature::Cylinder => FeatureType::Cylinder,
            Feature::Cone => FeatureType::Cone,
            Feature::Torus => FeatureType::Torus,
        }
    }
}

#[derive(Parser, Debug)]
#[command(
    name = "surfseek",
    author,
    version,
    about = "Fit a plane, sphere, cylinder, cone or torus around a seed point"
)]
struct Cli {
    /// ASCII point file: one `x y z` (or `x,y,z`) triple per line.
    input: PathBuf,

    /// Index of the seed point in the input file.
    #[arg(long)]
    seed_index: usize,

    /// Radius of the seed region around the seed point.
    #[arg(long)]
    seed_radius: f64,

    #[arg(long, value_enum, default_value = "any")]
    feature: Feature,

    /// A priori measurement noise of the scanner.
    #[arg(long, default_value = "0.01")]
    accuracy: f64,

    /// Average spacing between neighboring points.
    #[arg(long = "mean-distance", default_value = "0.05")]
    mean_distance: f64,

    /// Outward growth aggressiveness, 0 (off) to 10 (radical).
    #[arg(long = "radial-expansion", default_value = "5")]
    radial_expansion: u8,

    /// Along-surface growth aggressiveness, 0 (off) to 10 (radical).
    #[arg(long = "lateral-extension", default_value = "5")]
    lateral_extension: u8,

    #[arg(long = "cone-to-cylinder")]
    cone_to_cylinder: bool,

    #[arg(long = "torus-to-sphere")]
    torus_to_sphere: bool,

    #[arg(long = "torus-to-cylinder")]
    torus_to_cylinder: bool,

    /// Classify every input point against the fitted surface.
    #[arg(long = "inlier-flags")]
    inlier_flags: bool,

    #[arg(long)]
    report: Option<PathBuf>,
}

#[derive(Debug, Serialize)]
struct FitReport {
    requested: Feature,
    found: geom_core::FeatureType,
    rms_error: f64,
    primitive: Primitive,
    point_count: usize,
    inliers: Option<InlierSummary>,
}

#[derive(Debug, Serialize)]
struct InlierSummary {
    inlier_count: usize,
    outlier_count: usize,
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();
    let report = run(&cli)?;
    println!(
        "Found {:?} (rms {:.6}) from {} points",
        report.found, report.rms_error, report.point_count
    );
    Ok(())
}

fn run(cli: &Cli) -> Result<FitReport> {
    let points = load_xyz(&cli.input)
        .with_context(|| format!("cannot read points from {}", cli.input.display()))?;
    info!("loaded {} points from {}", points.len(), cli.input.display());

    let mut config = Config::new(cli.accuracy, cli.mean_distance)?;
    config.radial_expansion = SearchLevel::new(cli.radial_expansion)?;
    config.lateral_extension = SearchLevel::new(cli.lateral_extension)?;
    config.conversions = ConversionOptions {
        cone_to_cylinder: cli.cone_to_cylinder,
        torus_to_sphere: cli.torus_to_sphere,
        torus_to_cylinder: cli.torus_to_cylinder,
    };

    let point_count = points.len();
    let mut session = Session::new(config)?;
    session.set_points(points)?;
    let result = session.find_surface(
        cli.feature.into(),
        cli.seed_index,
        cli.seed_radius,
        cli.inlier_flags,
    )?;

    let report = build_report(cli, &result, point_count);
    if let Some(path) = &cli.report {
        write_report(path, &report)?;
    }
    Ok(report)
}

fn build_report(cli: &Cli, result: &FitResult, point_count: usize) -> FitReport {
    FitReport {
        requested: cli.feature,
        found: result.primitive.feature_type(),
        rms_error: result.rms_error,
        primitive: result.primitive.clone(),
        point_count,
        inliers: result.inlier_flags.as_ref().map(|flags| InlierSummary {
            inlier_count: flags.inlier_count(),
            outlier_count: flags.outlier_count(),
        }),
    }
}

fn write_report(path: &Path, report: &FitReport) -> Result<()> {
    let file = File::create(path)?;
    serde_json::to_writer_pretty(file, report)?;
    Ok(())
}

/// Reads one point per line; components split on whitespace or commas.
/// Blank lines and `#` comments are skipped.
fn load_xyz(path: &Path) -> Result<Vec<Vec3>> {
    let text = std::fs::read_to_string(path)?;
    let mut points = Vec::new();
    for (number, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let components: Vec<f64> = line
            .split(|c: char| c == ',' || c.is_whitespace())
            .filter(|part| !part.is_empty())
            .map(|part| {
                part.parse::<f64>()
                    .with_context(|| format!("line {}: bad component {part:?}", number + 1))
            })
            .collect::<Result<_>>()?;
        if components.len() < 3 {
            bail!("line {}: expected 3 components, got {}", number + 1, components.len());
        }
        points.push(Vec3::new(components[0], components[1], components[2]));
    }
    if points.is_empty() {
        bail!("no points in {}", path.display());
    }
    Ok(points)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn cli_parses_defaults() {
        let cli = Cli::parse_from([
            "surfseek",
            "cloud.xyz",
            "--seed-index",
            "3",
            "--seed-radius",
            "0.25",
        ]);
        assert_eq!(cli.feature, Feature::Any);
        assert_eq!(cli.seed_index, 3);
        assert_eq!(cli.accuracy, 0.01);
        assert_eq!(cli.mean_distance, 0.05);
        assert_eq!(cli.radial_expansion, 5);
        assert!(!cli.inlier_flags);
        assert!(cli.report.is_none());
    }

    #[test]
    fn load_xyz_accepts_commas_and_comments() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "# header").unwrap();
        writeln!(file, "1.0 2.0 3.0").unwrap();
        writeln!(file).unwrap();
        writeln!(file, "4.0,5.0,6.0").unwrap();
        let points = load_xyz(file.path()).unwrap();
        assert_eq!(points.len(), 2);
        assert_eq!(points[1], Vec3::new(4.0, 5.0, 6.0));
    }

    #[test]
    fn load_xyz_rejects_short_lines() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "1.0 2.0").unwrap();
        assert!(load_xyz(file.path()).is_err());
    }

    #[test]
    fn run_fits_a_plane_cloud() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        for i in 0..40 {
            for j in 0..40 {
                writeln!(file, "{} {} 0.0", i as f64 * 0.1, j as f64 * 0.1).unwrap();
            }
        }
        let report_file = tempfile::NamedTempFile::new().unwrap();
        let cli = Cli {
            input: file.path().to_path_buf(),
            seed_index: 820,
            seed_radius: 0.5,
            feature: Feature::Plane,
            accuracy: 0.01,
            mean_distance: 0.1,
            radial_expansion: 5,
            lateral_extension: 5,
            cone_to_cylinder: false,
            torus_to_sphere: false,
            torus_to_cylinder: false,
            inlier_flags: true,
            report: Some(report_file.path().to_path_buf()),
        };
        let report = run(&cli).expect("plane fit succeeds");
        assert_eq!(report.found, FeatureType::Plane);
        assert!(report.rms_error < 0.01);
        let inliers = report.inliers.expect("flags were requested");
        assert_eq!(inliers.inlier_count + inliers.outlier_count, 1600);
        let json = std::fs::read_to_string(report_file.path()).unwrap();
        assert!(json.contains("\"rms_error\""));
        assert!(json.contains("\"plane\""));
    }
}
