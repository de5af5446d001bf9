use super::{AggregationError, FieldType, FieldValue};
use serde::{Deserialize, Serialize};

type Result<T> = std::result::Result<T, AggregationError>;

/// Folds one column of a result set into a single value.
pub trait FieldAccumulator: Send + Sync {
    /// Column this accumulator reads and writes.
    fn position(&self) -> usize;

    /// Turn the first source row into an accumulator row.
    fn init(&self, acc_row: &mut [FieldValue]) -> Result<()>;

    /// Fold `src_row` into `acc_row`.
    fn update(&self, src_row: &[FieldValue], acc_row: &mut [FieldValue]) -> Result<()>;

    /// Replace intermediate state with the final value.
    fn finish(&self, acc_row: &mut [FieldValue]) -> Result<()>;
}

fn cell(row: &[FieldValue], pos: usize) -> Result<&FieldValue> {
    row.get(pos).ok_or(AggregationError::ColumnOutOfRange { pos, len: row.len() })
}

fn cell_mut(row: &mut [FieldValue], pos: usize) -> Result<&mut FieldValue> {
    let len = row.len();
    row.get_mut(pos)
        .ok_or(AggregationError::ColumnOutOfRange { pos, len })
}

/// Compensated sum of doubles.
///
/// Keeps a plain sum next to the compensated one so that overflowing to an
/// infinity yields the infinity rather than NaN.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct DoubleSum {
    sum: f64,
    compensation: f64,
    simple_sum: f64,
    count: u64,
}

impl DoubleSum {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, value: f64) {
        let y = value - self.compensation;
        let t = self.sum + y;
        self.compensation = (t - self.sum) - y;
        self.sum = t;
        self.simple_sum += value;
        self.count += 1;
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn value(&self) -> f64 {
        let value = self.sum - self.compensation;
        if value.is_nan() && self.simple_sum.is_infinite() {
            self.simple_sum
        } else {
            value
        }
    }
}

/// SUM over a numeric column.
///
/// Byte, short, int and long columns sum to a long, wrapping on overflow.
/// Float and double columns sum to a double. Nulls are skipped; a column with
/// no values sums to null.
#[derive(Debug, Clone)]
pub struct SumAccumulator {
    pos: usize,
    field_type: FieldType,
}

impl SumAccumulator {
    pub fn new(pos: usize, field_type: FieldType) -> Result<Self> {
        if !field_type.is_numeric() {
            return Err(AggregationError::UnsupportedType {
                function: "SUM",
                field_type,
            });
        }
        Ok(Self { pos, field_type })
    }

    pub fn field_type(&self) -> FieldType {
        self.field_type
    }

    fn mismatch(&self, found: &FieldValue) -> AggregationError {
        AggregationError::TypeMismatch {
            pos: self.pos,
            expected: self.field_type,
            found: found.clone(),
        }
    }

    fn long(&self, value: &FieldValue) -> Result<i64> {
        value.as_i64().ok_or_else(|| self.mismatch(value))
    }

    fn double(&self, value: &FieldValue) -> Result<f64> {
        value.as_f64().ok_or_else(|| self.mismatch(value))
    }
}

impl FieldAccumulator for SumAccumulator {
    fn position(&self) -> usize {
        self.pos
    }

    fn init(&self, acc_row: &mut [FieldValue]) -> Result<()> {
        let slot = cell_mut(acc_row, self.pos)?;
        if slot.is_null() {
            return Ok(());
        }
        *slot = if self.field_type.is_floating_point() {
            let mut sum = DoubleSum::new();
            sum.update(self.double(slot)?);
            FieldValue::DoubleSum(sum)
        } else {
            FieldValue::Long(self.long(slot)?)
        };
        Ok(())
    }

    fn update(&self, src_row: &[FieldValue], acc_row: &mut [FieldValue]) -> Result<()> {
        let value = cell(src_row, self.pos)?;
        if value.is_null() {
            return Ok(());
        }

        if self.field_type.is_floating_point() {
            let value = self.double(value)?;
            let slot = cell_mut(acc_row, self.pos)?;
            if slot.is_null() {
                *slot = FieldValue::DoubleSum(DoubleSum::new());
            }
            return match slot {
                FieldValue::DoubleSum(sum) => {
                    sum.update(value);
                    Ok(())
                }
                other => Err(self.mismatch(other)),
            };
        }

        let value = self.long(value)?;
        let slot = cell_mut(acc_row, self.pos)?;
        let sum = match *slot {
            FieldValue::Null => value,
            FieldValue::Long(sum) => sum.wrapping_add(value),
            ref other => return Err(self.mismatch(other)),
        };
        *slot = FieldValue::Long(sum);
        Ok(())
    }

    fn finish(&self, acc_row: &mut [FieldValue]) -> Result<()> {
        let slot = cell_mut(acc_row, self.pos)?;
        if let FieldValue::DoubleSum(sum) = *slot {
            *slot = FieldValue::Double(sum.value());
        }
        Ok(())
    }
}
