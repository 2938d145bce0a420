use std::collections::HashMap;

use geom_core::Vec3;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CloudError {
    #[error("point cloud must contain at least one point")]
    EmptyCloud,
    #[error("stride {stride} is smaller than one point ({min} bytes)")]
    StrideTooSmall { stride: usize, min: usize },
    #[error("buffer holds {actual} bytes but the description needs {expected}")]
    BufferTooShort { expected: usize, actual: usize },
    #[error("grid cell size must be positive, got {0}")]
    NonPositiveCellSize(String),
    #[error("allocation of {0} points failed")]
    OutOfMemory(usize),
}

/// Floating-point width of the components in a caller-supplied buffer.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Precision {
    F32,
    F64,
}

impl Precision {
    pub fn component_width(self) -> usize {
        match self {
            Precision::F32 => 4,
            Precision::F64 => 8,
        }
    }
}

/// A non-owning description of a caller-owned point buffer: contiguous bytes,
/// a point count, the stride between consecutive points, and the component
/// precision. Validated up front; converted once into owned storage.
#[derive(Debug, Clone, Copy)]
pub struct PointBuffer<'a> {
    data: &'a [u8],
    count: usize,
    stride: usize,
    precision: Precision,
}

impl<'a> PointBuffer<'a> {
    /// A tightly packed buffer: stride equals three components.
    pub fn packed(data: &'a [u8], count: usize, precision: Precision) -> Result<Self, CloudError> {
        Self::with_stride(data, count, 3 * precision.component_width(), precision)
    }

    pub fn with_stride(
        data: &'a [u8],
        count: usize,
        stride: usize,
        precision: Precision,
    ) -> Result<Self, CloudError> {
        let min = 3 * precision.component_width();
        if count == 0 {
            return Err(CloudError::EmptyCloud);
        }
        if stride < min {
            return Err(CloudError::StrideTooSmall { stride, min });
        }
        let expected = (count - 1) * stride + min;
        if data.len() < expected {
            return Err(CloudError::BufferTooShort {
                expected,
                actual: data.len(),
            });
        }
        Ok(Self {
            data,
            count,
            stride,
            precision,
        })
    }

    pub fn count(&self) -> usize {
        self.count
    }

    /// Copies the buffer into owned `f64` storage. The engine never touches
    /// the caller's memory again after this.
    pub fn to_points(&self) -> Result<Vec<Vec3>, CloudError> {
        let mut points = Vec::new();
        points
            .try_reserve_exact(self.count)
            .map_err(|_| CloudError::OutOfMemory(self.count))?;
        let width = self.precision.component_width();
        for i in 0..self.count {
            let base = i * self.stride;
            let x = self.read_component(base);
            let y = self.read_component(base + width);
            let z = self.read_component(base + 2 * width);
            points.push(Vec3::new(x, y, z));
        }
        Ok(points)
    }

    fn read_component(&self, offset: usize) -> f64 {
        match self.precision {
            Precision::F32 => {
                let bytes: [u8; 4] = self.data[offset..offset + 4].try_into().unwrap();
                f32::from_ne_bytes(bytes) as f64
            }
            Precision::F64 => {
                let bytes: [u8; 8] = self.data[offset..offset + 8].try_into().unwrap();
                f64::from_ne_bytes(bytes)
            }
        }
    }
}

pub fn points_from_f32(points: &[[f32; 3]]) -> Vec<Vec3> {
    points
        .iter()
        .map(|p| Vec3::new(p[0] as f64, p[1] as f64, p[2] as f64))
        .collect()
}

pub fn points_from_f64(points: &[[f64; 3]]) -> Vec<Vec3> {
    points.iter().map(|p| Vec3::new(p[0], p[1], p[2])).collect()
}

// --- Spatial index --------------------------------------------------------

/// Voxel hash grid over point indices. Built once per cloud assignment and
/// reused across fit invocations; parameter changes never trigger a rebuild.
#[derive(Debug, Clone)]
pub struct VoxelGrid {
    cell_size: f64,
    cells: HashMap<(i32, i32, i32), Vec<u32>>,
}

impl VoxelGrid {
    pub fn build(points: &[Vec3], cell_size: f64) -> Result<Self, CloudError> {
        if points.is_empty() {
            return Err(CloudError::EmptyCloud);
        }
        if !(cell_size > 0.0) || !cell_size.is_finite() {
            return Err(CloudError::NonPositiveCellSize(cell_size.to_string()));
        }
        let mut cells: HashMap<(i32, i32, i32), Vec<u32>> = HashMap::new();
        cells
            .try_reserve(points.len())
            .map_err(|_| CloudError::OutOfMemory(points.len()))?;
        for (i, p) in points.iter().enumerate() {
            cells
                .entry(Self::key(p, cell_size))
                .or_default()
                .push(i as u32);
        }
        Ok(Self { cell_size, cells })
    }

    fn key(p: &Vec3, cell_size: f64) -> (i32, i32, i32) {
        (
            (p.x / cell_size).floor() as i32,
            (p.y / cell_size).floor() as i32,
            (p.z / cell_size).floor() as i32,
        )
    }

    pub fn cell_size(&self) -> f64 {
        self.cell_size
    }

    /// Indices of all points within `radius` of `center`, ascending. Cells
    /// overlapping the query ball provide candidates; the exact distance test
    /// filters them.
    pub fn neighbors(&self, points: &[Vec3], center: &Vec3, radius: f64) -> Vec<u32> {
        if !(radius > 0.0) {
            return Vec::new();
        }
        let r2 = radius * radius;
        let lo = Self::key(&(center - Vec3::repeat(radius)), self.cell_size);
        let hi = Self::key(&(center + Vec3::repeat(radius)), self.cell_size);
        let mut found = Vec::new();
        for cx in lo.0..=hi.0 {
            for cy in lo.1..=hi.1 {
                for cz in lo.2..=hi.2 {
                    let Some(cell) = self.cells.get(&(cx, cy, cz)) else {
                        continue;
                    };
                    for &idx in cell {
                        if (points[idx as usize] - center).norm_squared() <= r2 {
                            found.push(idx);
                        }
                    }
                }
            }
        }
        found.sort_unstable();
        found
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn as_bytes_f32(points: &[[f32; 3]]) -> Vec<u8> {
        points
            .iter()
            .flat_map(|p| p.iter().flat_map(|c| c.to_ne_bytes()))
            .collect()
    }

    #[test]
    fn packed_f32_buffer_round_trips() {
        let raw = [[1.0f32, 2.0, 3.0], [-4.0, 5.5, 0.25]];
        let bytes = as_bytes_f32(&raw);
        let buffer = PointBuffer::packed(&bytes, 2, Precision::F32).unwrap();
        let points = buffer.to_points().unwrap();
        assert_eq!(points.len(), 2);
        assert_eq!(points[1], Vec3::new(-4.0, 5.5, 0.25));
    }

    #[test]
    fn strided_f64_buffer_skips_padding() {
        // 3 doubles plus 8 padding bytes per point.
        let mut bytes = Vec::new();
        for p in [[1.0f64, 2.0, 3.0], [4.0, 5.0, 6.0]] {
            for c in p {
                bytes.extend_from_slice(&c.to_ne_bytes());
            }
            bytes.extend_from_slice(&[0u8; 8]);
        }
        let buffer = PointBuffer::with_stride(&bytes, 2, 32, Precision::F64).unwrap();
        let points = buffer.to_points().unwrap();
        assert_eq!(points[0], Vec3::new(1.0, 2.0, 3.0));
        assert_eq!(points[1], Vec3::new(4.0, 5.0, 6.0));
    }

    #[test]
    fn zero_count_is_rejected() {
        let bytes = [0u8; 12];
        assert_eq!(
            PointBuffer::packed(&bytes, 0, Precision::F32).unwrap_err(),
            CloudError::EmptyCloud
        );
    }

    #[test]
    fn undersized_stride_is_rejected() {
        let bytes = [0u8; 64];
        let err = PointBuffer::with_stride(&bytes, 2, 8, Precision::F32).unwrap_err();
        assert_eq!(err, CloudError::StrideTooSmall { stride: 8, min: 12 });
    }

    #[test]
    fn short_buffer_is_rejected() {
        let bytes = [0u8; 20];
        let err = PointBuffer::packed(&bytes, 2, Precision::F32).unwrap_err();
        assert_eq!(
            err,
            CloudError::BufferTooShort {
                expected: 24,
                actual: 20
            }
        );
    }

    #[test]
    fn grid_rejects_bad_inputs() {
        assert_eq!(
            VoxelGrid::build(&[], 0.1).unwrap_err(),
            CloudError::EmptyCloud
        );
        let points = vec![Vec3::zeros()];
        assert!(matches!(
            VoxelGrid::build(&points, 0.0).unwrap_err(),
            CloudError::NonPositiveCellSize(_)
        ));
    }

    #[test]
    fn neighbors_match_brute_force() {
        let mut rng = StdRng::seed_from_u64(7);
        let points: Vec<Vec3> = (0..500)
            .map(|_| {
                Vec3::new(
                    rng.gen_range(-1.0..1.0),
                    rng.gen_range(-1.0..1.0),
                    rng.gen_range(-1.0..1.0),
                )
            })
            .collect();
        let grid = VoxelGrid::build(&points, 0.2).unwrap();
        let center = Vec3::new(0.1, -0.2, 0.3);
        let radius = 0.35;
        let got = grid.neighbors(&points, &center, radius);
        let expected: Vec<u32> = points
            .iter()
            .enumerate()
            .filter(|(_, p)| (*p - center).norm() <= radius)
            .map(|(i, _)| i as u32)
            .collect();
        assert!(!expected.is_empty());
        assert_eq!(got, expected);
    }

    #[test]
    fn neighbors_are_sorted_and_deterministic() {
        let points: Vec<Vec3> = (0..64)
            .map(|i| Vec3::new((i % 8) as f64 * 0.1, (i / 8) as f64 * 0.1, 0.0))
            .collect();
        let grid = VoxelGrid::build(&points, 0.15).unwrap();
        let center = Vec3::new(0.35, 0.35, 0.0);
        let a = grid.neighbors(&points, &center, 0.3);
        let b = grid.neighbors(&points, &center, 0.3);
        assert_eq!(a, b);
        assert!(a.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn non_positive_radius_yields_nothing() {
        let points = vec![Vec3::zeros(), Vec3::new(0.1, 0.0, 0.0)];
        let grid = VoxelGrid::build(&points, 0.5).unwrap();
        assert!(grid.neighbors(&points, &Vec3::zeros(), 0.0).is_empty());
    }
}
