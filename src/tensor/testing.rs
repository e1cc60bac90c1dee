//! Fixtures for unit tests: 2-D embeddings placed at angles on the unit circle

use candle_core::{DType, Device, Tensor, Var};

pub(crate) const TEST_DTYPES: [DType; 2] = [DType::F32, DType::F64];

pub(crate) fn angle_to_coord(angle_degrees: f64) -> [f64; 2] {
    let radians = angle_degrees.to_radians();
    [radians.cos(), radians.sin()]
}

/// Trainable `[angles.len(), 2]` embeddings
pub(crate) fn angle_embeddings(angles: &[f64], dtype: DType) -> Var {
    let data: Vec<f64> = angles.iter().flat_map(|&a| angle_to_coord(a)).collect();
    let tensor = Tensor::from_vec(data, (angles.len(), 2), &Device::Cpu)
        .unwrap()
        .to_dtype(dtype)
        .unwrap();
    Var::from_tensor(&tensor).unwrap()
}

/// `[2, angles.len()]` matrix whose columns are unit vectors at `angles`
pub(crate) fn angle_columns(angles: &[f64], dtype: DType) -> Tensor {
    let rows: Vec<f64> = angles
        .iter()
        .map(|&a| angle_to_coord(a)[0])
        .chain(angles.iter().map(|&a| angle_to_coord(a)[1]))
        .collect();
    Tensor::from_vec(rows, (2, angles.len()), &Device::Cpu)
        .unwrap()
        .to_dtype(dtype)
        .unwrap()
}

pub(crate) fn labels(ids: &[u32]) -> Tensor {
    Tensor::new(ids, &Device::Cpu).unwrap()
}

pub(crate) fn scalar(t: &Tensor) -> f64 {
    t.to_dtype(DType::F64).unwrap().to_scalar::<f64>().unwrap()
}

pub(crate) fn assert_close(actual: f64, expected: f64, rtol: f64) {
    let tol = rtol * expected.abs().max(1.0);
    assert!(
        (actual - expected).abs() <= tol,
        "expected {expected}, got {actual} (tolerance {tol})"
    );
}
