use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde_json::{Map, Value as Json};

use super::figure::Figure;
use crate::executor::protocol::VariableItem;

/// Rows shown by the text rendering of a frame before it is elided.
const DISPLAY_ROWS: usize = 20;

/// A value living in an execution namespace.
///
/// Namespaces are owned by the store between executions, so every variant
/// is plain data that can be handed to a fresh script runtime.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Nil,
    Bool(bool),
    Integer(i64),
    Number(f64),
    Text(String),
    Table(Arc<Frame>),
    Figure(Arc<Figure>),
    Sequence(Vec<Value>),
    Mapping(BTreeMap<String, Value>),
    /// Handle to the data backend, rebound by the runtime on every load.
    Backend,
}

pub type Namespace = BTreeMap<String, Value>;

impl Value {
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Nil => "nil",
            Value::Bool(_) => "boolean",
            Value::Integer(_) | Value::Number(_) => "number",
            Value::Text(_) => "string",
            Value::Table(_) => "frame",
            Value::Figure(_) => "figure",
            Value::Sequence(_) | Value::Mapping(_) => "table",
            Value::Backend => "engine",
        }
    }

    /// Convert an evaluated value into the items returned by a variable read.
    ///
    /// Sequences and mappings are flattened one level so that a list of
    /// frames produces one item each. Mapping entries yield the key as a
    /// string item followed by the value's item.
    pub fn to_items(&self) -> Vec<VariableItem> {
        match self {
            Value::Sequence(items) => items.iter().map(Value::to_item).collect(),
            Value::Mapping(entries) => entries
                .iter()
                .flat_map(|(key, value)| [VariableItem::string(key.clone()), value.to_item()])
                .collect(),
            other => vec![other.to_item()],
        }
    }

    fn to_item(&self) -> VariableItem {
        match self {
            Value::Table(frame) => VariableItem::table(frame.to_records_json()),
            Value::Figure(figure) => match figure.to_jpeg_base64() {
                Ok(encoded) => VariableItem::image(encoded),
                Err(e) => {
                    tracing::warn!(error = %e, title = %figure.title, "figure encoding failed");
                    VariableItem::string(String::new())
                }
            },
            other => VariableItem::string(other.to_string()),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Nil => write!(f, "nil"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Integer(i) => write!(f, "{i}"),
            Value::Number(n) => write!(f, "{}", format_number(*n)),
            Value::Text(s) => write!(f, "{s}"),
            Value::Table(frame) => write!(f, "{frame}"),
            Value::Figure(figure) => write!(f, "<figure: {}>", figure.title),
            Value::Sequence(items) => {
                write!(f, "{{")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, "}}")
            }
            Value::Mapping(entries) => {
                write!(f, "{{")?;
                for (i, (key, item)) in entries.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{key} = {item}")?;
                }
                write!(f, "}}")
            }
            Value::Backend => write!(f, "<engine>"),
        }
    }
}

fn format_number(n: f64) -> String {
    if n.is_finite() && n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{n:.1}")
    } else {
        n.to_string()
    }
}

fn cell_text(cell: &Json) -> String {
    match cell {
        Json::Null => "NaN".to_string(),
        Json::String(s) => s.clone(),
        Json::Number(n) => match n.as_f64() {
            Some(f) if !n.is_i64() && !n.is_u64() => format_number(f),
            _ => n.to_string(),
        },
        other => other.to_string(),
    }
}

fn cell_number(cell: &Json) -> Option<f64> {
    match cell {
        Json::Number(n) => n.as_f64(),
        Json::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        _ => None,
    }
}

/// Ordering used by `sort_by`: numbers before strings, nulls last.
fn compare_cells(a: &Json, b: &Json) -> Ordering {
    match (a, b) {
        (Json::Null, Json::Null) => Ordering::Equal,
        (Json::Null, _) => Ordering::Greater,
        (_, Json::Null) => Ordering::Less,
        (Json::String(x), Json::String(y)) => x.cmp(y),
        (Json::String(_), _) => Ordering::Greater,
        (_, Json::String(_)) => Ordering::Less,
        _ => match (cell_number(a), cell_number(b)) {
            (Some(x), Some(y)) => x.partial_cmp(&y).unwrap_or(Ordering::Equal),
            _ => Ordering::Equal,
        },
    }
}

/// A tabular value: named columns, row-major cells, and an optional
/// row index. `None` means the default `0..n` positional index.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Frame {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Json>>,
    pub index: Option<Vec<Json>>,
}

impl Frame {
    pub fn new(columns: Vec<String>, rows: Vec<Vec<Json>>) -> Self {
        Self {
            columns,
            rows,
            index: None,
        }
    }

    pub fn with_index(mut self, index: Vec<Json>) -> Self {
        self.index = Some(index);
        self
    }

    pub fn nrows(&self) -> usize {
        self.rows.len()
    }

    pub fn index_labels(&self) -> Vec<Json> {
        match &self.index {
            Some(index) => index.clone(),
            None => (0..self.rows.len()).map(|i| Json::from(i as u64)).collect(),
        }
    }

    /// True when the index is absent or exactly the positions `0..n`.
    pub fn has_trivial_index(&self) -> bool {
        match &self.index {
            None => true,
            Some(index) => index
                .iter()
                .enumerate()
                .all(|(i, label)| label.as_u64() == Some(i as u64)),
        }
    }

    /// Serialize as a JSON array of records. A non-trivial index is emitted
    /// as a leading column with an empty name.
    pub fn to_records_json(&self) -> String {
        let labels = (!self.has_trivial_index()).then(|| self.index_labels());
        let records: Vec<Json> = self
            .rows
            .iter()
            .enumerate()
            .map(|(i, row)| {
                let mut record = Map::new();
                if let Some(labels) = &labels {
                    record.insert(String::new(), labels.get(i).cloned().unwrap_or(Json::Null));
                }
                for (column, cell) in self.columns.iter().zip(row) {
                    record.insert(column.clone(), cell.clone());
                }
                Json::Object(record)
            })
            .collect();
        Json::Array(records).to_string()
    }

    pub fn column_position(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    pub fn column(&self, name: &str) -> Option<Vec<Json>> {
        let pos = self.column_position(name)?;
        Some(
            self.rows
                .iter()
                .map(|row| row.get(pos).cloned().unwrap_or(Json::Null))
                .collect(),
        )
    }

    pub fn row(&self, position: usize) -> Option<&[Json]> {
        self.rows.get(position).map(Vec::as_slice)
    }

    fn select(&self, positions: &[usize]) -> Frame {
        let labels = self.index_labels();
        Frame {
            columns: self.columns.clone(),
            rows: positions.iter().map(|&p| self.rows[p].clone()).collect(),
            index: Some(positions.iter().map(|&p| labels[p].clone()).collect()),
        }
    }

    pub fn head(&self, n: usize) -> Frame {
        let mut frame = self.clone();
        frame.rows.truncate(n);
        if let Some(index) = frame.index.as_mut() {
            index.truncate(n);
        }
        frame
    }

    /// Stable sort on one column. Index labels travel with their rows.
    pub fn sort_by(&self, name: &str, descending: bool) -> Result<Frame, String> {
        let pos = self
            .column_position(name)
            .ok_or_else(|| format!("no column named '{name}'"))?;
        let mut order: Vec<usize> = (0..self.rows.len()).collect();
        order.sort_by(|&a, &b| {
            let ord = compare_cells(
                self.rows[a].get(pos).unwrap_or(&Json::Null),
                self.rows[b].get(pos).unwrap_or(&Json::Null),
            );
            if descending { ord.reverse() } else { ord }
        });
        Ok(self.select(&order))
    }

    pub fn filter_rows(&self, keep: &[bool]) -> Frame {
        let positions: Vec<usize> = keep
            .iter()
            .enumerate()
            .filter(|(i, k)| **k && *i < self.rows.len())
            .map(|(i, _)| i)
            .collect();
        self.select(&positions)
    }

    /// Move a column into the index.
    pub fn set_index(&self, name: &str) -> Result<Frame, String> {
        let pos = self
            .column_position(name)
            .ok_or_else(|| format!("no column named '{name}'"))?;
        let mut columns = self.columns.clone();
        columns.remove(pos);
        let mut index = Vec::with_capacity(self.rows.len());
        let rows = self
            .rows
            .iter()
            .map(|row| {
                let mut row = row.clone();
                index.push(if pos < row.len() { row.remove(pos) } else { Json::Null });
                row
            })
            .collect();
        Ok(Frame::new(columns, rows).with_index(index))
    }

    /// Turn a non-trivial index back into a leading `index` column.
    pub fn reset_index(&self) -> Frame {
        if self.has_trivial_index() {
            return Frame::new(self.columns.clone(), self.rows.clone());
        }
        let labels = self.index_labels();
        let mut columns = Vec::with_capacity(self.columns.len() + 1);
        columns.push("index".to_string());
        columns.extend(self.columns.iter().cloned());
        let rows = self
            .rows
            .iter()
            .zip(labels)
            .map(|(row, label)| {
                let mut out = Vec::with_capacity(row.len() + 1);
                out.push(label);
                out.extend(row.iter().cloned());
                out
            })
            .collect();
        Frame::new(columns, rows)
    }

    pub fn sum(&self, name: &str) -> Result<f64, String> {
        let cells = self
            .column(name)
            .ok_or_else(|| format!("no column named '{name}'"))?;
        Ok(cells.iter().filter_map(cell_number).sum())
    }

    pub fn mean(&self, name: &str) -> Result<f64, String> {
        let cells = self
            .column(name)
            .ok_or_else(|| format!("no column named '{name}'"))?;
        let numbers: Vec<f64> = cells.iter().filter_map(cell_number).collect();
        if numbers.is_empty() {
            return Ok(f64::NAN);
        }
        Ok(numbers.iter().sum::<f64>() / numbers.len() as f64)
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let labels: Vec<String> = self.index_labels().iter().map(cell_text).collect();
        let shown = self.rows.len().min(DISPLAY_ROWS);
        let label_width = labels.iter().take(shown).map(|l| l.len()).max().unwrap_or(0);

        let widths: Vec<usize> = self
            .columns
            .iter()
            .enumerate()
            .map(|(c, name)| {
                self.rows
                    .iter()
                    .take(shown)
                    .filter_map(|row| row.get(c))
                    .map(|cell| cell_text(cell).len())
                    .chain(std::iter::once(name.len()))
                    .max()
                    .unwrap_or(0)
            })
            .collect();

        write!(f, "{:label_width$}", "")?;
        for (name, width) in self.columns.iter().zip(&widths) {
            write!(f, "  {name:>width$}")?;
        }
        for (row, label) in self.rows.iter().take(shown).zip(&labels) {
            writeln!(f)?;
            write!(f, "{label:<label_width$}")?;
            for (cell, width) in row.iter().zip(&widths) {
                write!(f, "  {:>width$}", cell_text(cell))?;
            }
        }
        if self.rows.len() > shown {
            writeln!(f)?;
            write!(f, "...")?;
        }
        writeln!(f)?;
        write!(f, "\n[{} rows x {} columns]", self.rows.len(), self.columns.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sales() -> Frame {
        Frame::new(
            vec!["region".into(), "amount".into()],
            vec![
                vec![json!("north"), json!(120)],
                vec![json!("south"), json!(80.5)],
                vec![json!("east"), json!(200)],
            ],
        )
    }

    #[test]
    fn records_omit_default_index() {
        let records: Json = serde_json::from_str(&sales().to_records_json()).unwrap();
        assert_eq!(records[0], json!({"region": "north", "amount": 120}));
        assert!(records[0].get("").is_none());
    }

    #[test]
    fn records_lead_with_custom_index() {
        let frame = sales().set_index("region").unwrap();
        let text = frame.to_records_json();
        assert!(text.starts_with(r#"[{"":"north","amount":120}"#));
    }

    #[test]
    fn explicit_positional_index_is_trivial() {
        let frame = sales().with_index(vec![json!(0), json!(1), json!(2)]);
        assert!(frame.has_trivial_index());
        let frame = sales().with_index(vec![json!(1), json!(2), json!(3)]);
        assert!(!frame.has_trivial_index());
    }

    #[test]
    fn sorting_keeps_original_labels() {
        let sorted = sales().sort_by("amount", true).unwrap();
        assert_eq!(sorted.column("region").unwrap()[0], json!("east"));
        assert_eq!(sorted.index_labels(), vec![json!(2), json!(0), json!(1)]);
        assert!(!sorted.has_trivial_index());
        assert!(sorted.reset_index().has_trivial_index());
    }

    #[test]
    fn sort_unknown_column_errors() {
        assert_eq!(
            sales().sort_by("missing", false).unwrap_err(),
            "no column named 'missing'"
        );
    }

    #[test]
    fn reset_index_inserts_index_column() {
        let reset = sales().set_index("region").unwrap().reset_index();
        assert_eq!(reset.columns, vec!["index", "amount"]);
        assert_eq!(reset.rows[1], vec![json!("south"), json!(80.5)]);
    }

    #[test]
    fn aggregates_skip_non_numeric_cells() {
        let mut frame = sales();
        frame.rows.push(vec![json!("west"), Json::Null]);
        assert_eq!(frame.sum("amount").unwrap(), 400.5);
        assert!((frame.mean("amount").unwrap() - 133.5).abs() < 1e-9);
    }

    #[test]
    fn head_truncates_index_too() {
        let frame = sales().set_index("region").unwrap().head(2);
        assert_eq!(frame.nrows(), 2);
        assert_eq!(frame.index.as_ref().map(Vec::len), Some(2));
    }

    #[test]
    fn sequence_items_are_expanded() {
        let value = Value::Sequence(vec![
            Value::Table(Arc::new(sales())),
            Value::Integer(3),
        ]);
        let items = value.to_items();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].kind, "table");
        assert_eq!(items[1].kind, "string");
        assert_eq!(items[1].data, "3");
    }

    #[test]
    fn mapping_items_put_key_before_value() {
        let mut entries = BTreeMap::new();
        entries.insert("q1".to_string(), Value::Integer(10));
        entries.insert("q2".to_string(), Value::Table(Arc::new(sales())));
        let items = Value::Mapping(entries).to_items();
        let kinds: Vec<&str> = items.iter().map(|i| i.kind.as_str()).collect();
        assert_eq!(kinds, vec!["string", "string", "string", "table"]);
        assert_eq!(items[0].data, "q1");
        assert_eq!(items[1].data, "10");
        assert_eq!(items[2].data, "q2");
    }

    #[test]
    fn scalar_is_a_single_string_item() {
        let items = Value::Number(0.25).to_items();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].data, "0.25");
        assert_eq!(Value::Number(3.0).to_string(), "3.0");
    }

    #[test]
    fn frame_display_has_shape_footer() {
        let text = sales().to_string();
        assert!(text.contains("region"));
        assert!(text.ends_with("[3 rows x 2 columns]"));
    }
}
