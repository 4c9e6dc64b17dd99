//! Numeric tables read from CSV

use crate::{Error, Result};

/// Numeric columns of a CSV file.
///
/// The first column is treated as the row index and dropped; any column with
/// a value that is not a number is left out.
#[derive(Debug, Clone, PartialEq)]
pub struct Dataset {
    columns: Vec<String>,
    /// Column-major values
    values: Vec<Vec<f64>>,
}

impl Dataset {
    /// Parse CSV text with a header row
    pub fn from_csv(data: &[u8]) -> Result<Self> {
        let text = std::str::from_utf8(data)
            .map_err(|e| Error::Data(format!("CSV is not UTF-8: {e}")))?;
        let mut records = parse_records(text.trim_start_matches('\u{feff}'))?.into_iter();

        let header = records
            .next()
            .ok_or_else(|| Error::Data("CSV is empty".to_string()))?;
        if header.len() < 2 {
            return Err(Error::Data(
                "CSV needs an index column and at least one data column".to_string(),
            ));
        }

        let width = header.len();
        let mut raw: Vec<Vec<String>> = vec![Vec::new(); width - 1];
        for (line, record) in records.enumerate() {
            if record.len() == 1 && record[0].is_empty() {
                continue;
            }
            if record.len() != width {
                return Err(Error::Data(format!(
                    "CSV row {} has {} fields, expected {width}",
                    line + 2,
                    record.len()
                )));
            }
            for (column, field) in raw.iter_mut().zip(record.into_iter().skip(1)) {
                column.push(field);
            }
        }

        let mut columns = Vec::new();
        let mut values = Vec::new();
        for (name, fields) in header.into_iter().skip(1).zip(raw) {
            let parsed: Option<Vec<f64>> = fields.iter().map(|f| f.trim().parse().ok()).collect();
            if let Some(parsed) = parsed {
                columns.push(name);
                values.push(parsed);
            }
        }

        Ok(Self { columns, values })
    }

    /// Numeric column names in file order
    #[must_use]
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Number of rows
    #[must_use]
    pub fn len(&self) -> usize {
        self.values.first().map_or(0, Vec::len)
    }

    /// Whether there are no rows
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Values of a column
    #[must_use]
    pub fn column(&self, name: &str) -> Option<&[f64]> {
        self.columns
            .iter()
            .position(|c| c == name)
            .map(|i| self.values[i].as_slice())
    }

    /// `(x, y)` pairs of two columns
    #[must_use]
    pub fn points(&self, x: &str, y: &str) -> Option<Vec<[f64; 2]>> {
        let xs = self.column(x)?;
        let ys = self.column(y)?;
        Some(xs.iter().zip(ys).map(|(x, y)| [*x, *y]).collect())
    }
}

/// Split CSV text into records. Quoted fields may contain commas, newlines
/// and doubled quotes.
fn parse_records(text: &str) -> Result<Vec<Vec<String>>> {
    let mut records = Vec::new();
    let mut record = Vec::new();
    let mut field = String::new();
    let mut in_quotes = false;
    let mut chars = text.chars().peekable();

    while let Some(c) = chars.next() {
        if in_quotes {
            match c {
                '"' if chars.peek() == Some(&'"') => {
                    field.push('"');
                    chars.next();
                }
                '"' => in_quotes = false,
                _ => field.push(c),
            }
            continue;
        }

        match c {
            '"' => in_quotes = true,
            ',' => record.push(std::mem::take(&mut field)),
            '\r' => {}
            '\n' => {
                record.push(std::mem::take(&mut field));
                records.push(std::mem::take(&mut record));
            }
            _ => field.push(c),
        }
    }

    if in_quotes {
        return Err(Error::Data("CSV ends inside a quoted field".to_string()));
    }
    if !field.is_empty() || !record.is_empty() {
        record.push(field);
        records.push(record);
    }

    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const IRIS: &str = "\
,sepal length (cm),sepal width (cm),petal length (cm),species
0,5.1,3.5,1.4,setosa
1,4.9,3.0,1.4,setosa
2,6.3,3.3,6.0,virginica
";

    #[test]
    fn drops_index_and_text_columns() {
        let data = Dataset::from_csv(IRIS.as_bytes()).unwrap();
        assert_eq!(
            data.columns(),
            &[
                "sepal length (cm)".to_string(),
                "sepal width (cm)".to_string(),
                "petal length (cm)".to_string(),
            ]
        );
        assert_eq!(data.len(), 3);
        assert_eq!(data.column("sepal width (cm)"), Some(&[3.5, 3.0, 3.3][..]));
    }

    #[test]
    fn points_pair_two_columns() {
        let data = Dataset::from_csv(IRIS.as_bytes()).unwrap();
        let points = data.points("sepal length (cm)", "petal length (cm)").unwrap();
        assert_eq!(points[2], [6.3, 6.0]);
        assert!(data.points("species", "sepal width (cm)").is_none());
    }

    #[test]
    fn handles_quotes_and_crlf() {
        let csv = "id,\"a, quoted\",b\r\n0,1,\"2\"\r\n1,3,4\r\n";
        let data = Dataset::from_csv(csv.as_bytes()).unwrap();
        assert_eq!(data.columns(), &["a, quoted".to_string(), "b".to_string()]);
        assert_eq!(data.column("b"), Some(&[2.0, 4.0][..]));
    }

    #[test]
    fn rejects_ragged_rows() {
        let csv = "id,a,b\n0,1,2\n1,3\n";
        assert!(matches!(Dataset::from_csv(csv.as_bytes()), Err(Error::Data(_))));
    }

    #[test]
    fn rejects_unterminated_quote() {
        assert!(parse_records("a,\"b\n").is_err());
    }

    #[test]
    fn empty_input_is_an_error() {
        assert!(Dataset::from_csv(b"").is_err());
    }
}
