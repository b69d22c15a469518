use std::cell::Cell;

use serde::{de::Error as _, Deserialize, Deserializer, Serialize};
use serde_json::{Number, Value};

use crate::error::AppError;

/// Dense row-major `f32` array with an explicit shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tensor {
    shape: Vec<usize>,
    data: Vec<f32>,
}

impl Tensor {
    pub fn new(shape: Vec<usize>, data: Vec<f32>) -> Result<Self, AppError> {
        let expected = shape
            .iter()
            .try_fold(1usize, |acc, dim| acc.checked_mul(*dim))
            .ok_or_else(|| AppError::Validation(format!("tensor shape {shape:?} overflows")))?;
        if expected != data.len() {
            return Err(AppError::Validation(format!(
                "tensor shape {shape:?} expects {expected} values, got {}",
                data.len()
            )));
        }
        Ok(Self { shape, data })
    }

    /// Builds a 2-d tensor from equally sized rows.
    pub fn from_rows(rows: Vec<Vec<f32>>) -> Result<Self, AppError> {
        let width = rows.first().map_or(0, Vec::len);
        let height = rows.len();
        let mut data = Vec::with_capacity(height.saturating_mul(width));
        for (idx, row) in rows.into_iter().enumerate() {
            if row.len() != width {
                return Err(AppError::Validation(format!(
                    "ragged matrix: row {idx} has {} values, expected {width}",
                    row.len()
                )));
            }
            data.extend(row);
        }
        Self::new(vec![height, width], data)
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    /// Nested JSON lists mirroring the shape; non-finite values cannot be represented.
    pub fn to_nested(&self) -> Result<Value, AppError> {
        nest(&self.data, &self.shape)
    }
}

fn nest(data: &[f32], shape: &[usize]) -> Result<Value, AppError> {
    let Some((&dim, rest)) = shape.split_first() else {
        return data.first().map_or(Ok(Value::Null), |value| number(*value));
    };
    let stride = rest.iter().product::<usize>();
    if stride == 0 {
        return (0..dim)
            .map(|_| nest(&[], rest))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array);
    }
    data.chunks(stride)
        .take(dim)
        .map(|chunk| nest(chunk, rest))
        .collect::<Result<Vec<_>, _>>()
        .map(Value::Array)
}

fn number(value: f32) -> Result<Value, AppError> {
    Number::from_f64(f64::from(value))
        .map(Value::Number)
        .ok_or_else(|| AppError::Conversion(format!("non-finite tensor value {value}")))
}

/// Object model of the native batch-file encoding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StoredValue {
    Tensor(Tensor),
    List(#[serde(deserialize_with = "bounded_list")] Vec<StoredValue>),
    Text(String),
    Number(f64),
    None,
}

impl StoredValue {
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Tensor(_) => "tensor",
            Self::List(_) => "list",
            Self::Text(_) => "text",
            Self::Number(_) => "number",
            Self::None => "none",
        }
    }

    /// Converts a tensor element to nested numeric lists; every other value is rejected.
    pub fn to_interchange(&self) -> Result<Value, AppError> {
        match self {
            Self::Tensor(tensor) => tensor.to_nested(),
            other => Err(AppError::Conversion(format!(
                "cannot convert {} element to a numeric list",
                other.type_name()
            ))),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, AppError> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, AppError> {
        Ok(bincode::deserialize(bytes)?)
    }
}

/// Deepest list nesting accepted when decoding. bincode recurses once per level, so an
/// unbounded depth lets a crafted file exhaust the stack.
pub const MAX_LIST_DEPTH: usize = 64;

thread_local! {
    static LIST_DEPTH: Cell<usize> = const { Cell::new(0) };
}

struct DepthGuard;

impl DepthGuard {
    fn enter() -> Option<Self> {
        LIST_DEPTH.with(|depth| {
            let next = depth.get().saturating_add(1);
            if next > MAX_LIST_DEPTH {
                return None;
            }
            depth.set(next);
            Some(Self)
        })
    }
}

impl Drop for DepthGuard {
    fn drop(&mut self) {
        LIST_DEPTH.with(|depth| depth.set(depth.get().saturating_sub(1)));
    }
}

fn bounded_list<'de, D>(deserializer: D) -> Result<Vec<StoredValue>, D::Error>
where
    D: Deserializer<'de>,
{
    let _guard = DepthGuard::enter().ok_or_else(|| {
        D::Error::custom(format!("lists nested deeper than {MAX_LIST_DEPTH} levels"))
    })?;
    Vec::<StoredValue>::deserialize(deserializer)
}

impl From<Vec<Tensor>> for StoredValue {
    fn from(tensors: Vec<Tensor>) -> Self {
        Self::List(tensors.into_iter().map(Self::Tensor).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn new_rejects_mismatched_shape() {
        let result = Tensor::new(vec![2, 2], vec![1.0, 2.0, 3.0]);
        assert!(matches!(result, Err(AppError::Validation(_))));
    }

    #[test]
    fn from_rows_rejects_ragged_input() {
        let result = Tensor::from_rows(vec![vec![1.0, 2.0], vec![3.0]]);
        assert!(matches!(result, Err(AppError::Validation(_))));
    }

    #[test]
    fn to_nested_follows_shape() {
        let tensor = Tensor::from_rows(vec![vec![1.0, 2.0, 3.0], vec![4.0, 5.0, 6.0]]).unwrap();
        assert_eq!(
            tensor.to_nested().unwrap(),
            json!([[1.0, 2.0, 3.0], [4.0, 5.0, 6.0]])
        );

        let empty_rows = Tensor::new(vec![2, 0], Vec::new()).unwrap();
        assert_eq!(empty_rows.to_nested().unwrap(), json!([[], []]));
    }

    #[test]
    fn to_nested_rejects_non_finite_values() {
        let tensor = Tensor::new(vec![1], vec![f32::NAN]).unwrap();
        assert!(matches!(tensor.to_nested(), Err(AppError::Conversion(_))));
    }

    #[test]
    fn interchange_conversion_only_accepts_tensors() {
        let text = StoredValue::Text("MKV".into());
        assert!(matches!(text.to_interchange(), Err(AppError::Conversion(_))));

        let nested = StoredValue::List(vec![StoredValue::None]);
        assert!(matches!(
            nested.to_interchange(),
            Err(AppError::Conversion(_))
        ));
    }

    #[test]
    fn decode_reads_back_encoded_list() {
        let value = StoredValue::from(vec![Tensor::new(vec![2], vec![0.5, -0.5]).unwrap()]);
        let bytes = value.encode().unwrap();
        assert_eq!(StoredValue::decode(&bytes).unwrap(), value);
    }

    fn nested_lists(depth: usize) -> StoredValue {
        (0..depth).fold(StoredValue::None, |inner, _| StoredValue::List(vec![inner]))
    }

    #[test]
    fn decode_accepts_nesting_up_to_the_limit() {
        let value = nested_lists(MAX_LIST_DEPTH);
        assert_eq!(StoredValue::decode(&value.encode().unwrap()).unwrap(), value);
    }

    #[test]
    fn decode_rejects_excessive_nesting_without_recursing_through_it() {
        // Variant 1 (`List`) followed by a length of 1, repeated far beyond the limit.
        let mut bytes = Vec::new();
        for _ in 0..200_000 {
            bytes.extend_from_slice(&1u32.to_le_bytes());
            bytes.extend_from_slice(&1u64.to_le_bytes());
        }
        assert!(matches!(
            StoredValue::decode(&bytes),
            Err(AppError::Serialization(_))
        ));

        let too_deep = nested_lists(MAX_LIST_DEPTH + 1).encode().unwrap();
        assert!(StoredValue::decode(&too_deep).is_err());

        // Depth tracking is released after a failed decode.
        let shallow = nested_lists(3);
        assert_eq!(StoredValue::decode(&shallow.encode().unwrap()).unwrap(), shallow);
    }
}
