use std::path::Path;

use serde_json::{Map, Value};

/// Parsed CSV in the shape carried by `uploadComplete` artifacts.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Upload {
    pub headers: Vec<String>,
    pub data: Vec<Map<String, Value>>,
}

impl Upload {
    pub fn from_path(path: &Path) -> Result<Self, csv::Error> {
        Self::from_reader(csv::Reader::from_path(path)?)
    }

    pub fn parse(text: &str) -> Result<Self, csv::Error> {
        Self::from_reader(csv::Reader::from_reader(text.as_bytes()))
    }

    fn from_reader<R: std::io::Read>(mut reader: csv::Reader<R>) -> Result<Self, csv::Error> {
        let headers: Vec<String> = reader.headers()?.iter().map(str::to_string).collect();
        let mut data = Vec::new();
        for record in reader.records() {
            let record = record?;
            let row: Map<String, Value> = headers
                .iter()
                .zip(record.iter())
                .map(|(h, v)| (h.clone(), cell(v)))
                .collect();
            data.push(row);
        }
        Ok(Self { headers, data })
    }
}

// Numbers stay numbers so the graph can aggregate them.
fn cell(raw: &str) -> Value {
    let raw = raw.trim();
    if let Ok(i) = raw.parse::<i64>() {
        return Value::from(i);
    }
    match raw.parse::<f64>() {
        Ok(f) if f.is_finite() => Value::from(f),
        _ => Value::from(raw),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_headers_and_typed_cells() {
        let up = Upload::parse("a,b\n1,x\n2.5,y\n").unwrap();
        assert_eq!(up.headers, vec!["a", "b"]);
        assert_eq!(up.data.len(), 2);
        assert_eq!(up.data[0]["a"], Value::from(1));
        assert_eq!(up.data[1]["a"], Value::from(2.5));
        assert_eq!(up.data[1]["b"], Value::from("y"));
    }
}
