use quern_error::{QuernError, Result};

use crate::scalar::ScalarValue;

/// Representation of a single row.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Row {
    pub columns: Vec<ScalarValue>,
}

impl Row {
    pub const fn empty() -> Self {
        Row {
            columns: Vec::new(),
        }
    }

    pub fn new(columns: Vec<ScalarValue>) -> Self {
        Row { columns }
    }

    pub fn num_columns(&self) -> usize {
        self.columns.len()
    }

    pub fn column(&self, idx: usize) -> Result<&ScalarValue> {
        self.columns.get(idx).ok_or_else(|| {
            QuernError::Internal(format!(
                "tried to get column {idx} in a row with {} columns",
                self.columns.len()
            ))
        })
    }

    /// Return an iterator over all columns in the row.
    pub fn iter(&self) -> impl Iterator<Item = &ScalarValue> {
        self.columns.iter()
    }

    /// Build a new row containing only the given columns, in order.
    pub fn project(&self, indices: &[usize]) -> Result<Row> {
        let columns = indices
            .iter()
            .map(|&idx| self.column(idx).cloned())
            .collect::<Result<Vec<_>>>()?;
        Ok(Row { columns })
    }

    /// Approximate in-memory footprint, used for arena accounting.
    pub fn size_bytes(&self) -> usize {
        std::mem::size_of::<Row>() + self.columns.iter().map(|c| c.size_bytes()).sum::<usize>()
    }

    /// Append a self-describing encoding of this row: a u16 column count
    /// followed by each column's scalar encoding.
    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&(self.columns.len() as u16).to_le_bytes());
        for col in &self.columns {
            col.encode_into(buf);
        }
    }

    /// Decode a row previously written by `encode_into`. Returns the row and
    /// the number of bytes consumed.
    pub fn decode_from(buf: &[u8]) -> Result<(Row, usize)> {
        let count_bytes = buf
            .get(..2)
            .ok_or_else(|| QuernError::SpillCorruption("truncated row encoding".to_string()))?;
        let count = u16::from_le_bytes(count_bytes.try_into().unwrap()) as usize;

        let mut offset = 2;
        let mut columns = Vec::with_capacity(count);
        for _ in 0..count {
            let (value, used) = ScalarValue::decode_from(&buf[offset..])?;
            columns.push(value);
            offset += used;
        }

        Ok((Row { columns }, offset))
    }
}

impl FromIterator<ScalarValue> for Row {
    fn from_iter<T: IntoIterator<Item = ScalarValue>>(iter: T) -> Self {
        Row {
            columns: iter.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Row {
        Row::new(vec![
            ScalarValue::Utf8("k".to_string()),
            ScalarValue::Int64(42),
            ScalarValue::Null,
        ])
    }

    #[test]
    fn project_reorders() {
        let row = sample();
        let projected = row.project(&[1, 0]).unwrap();
        assert_eq!(
            projected,
            Row::new(vec![
                ScalarValue::Int64(42),
                ScalarValue::Utf8("k".to_string())
            ])
        );
    }

    #[test]
    fn project_out_of_bounds() {
        assert!(sample().project(&[3]).is_err());
    }

    #[test]
    fn encode_decode_roundtrip() {
        let row = sample();
        let mut buf = Vec::new();
        row.encode_into(&mut buf);
        let (decoded, used) = Row::decode_from(&buf).unwrap();
        assert_eq!(row, decoded);
        assert_eq!(used, buf.len());
    }
}
