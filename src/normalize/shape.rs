use crate::constants::CANDIDATE_COLUMNS;

/// What a reader produced for one input file.
#[derive(Debug, Clone, PartialEq)]
pub enum RecordShape {
    /// Named columns with row-major cells; short rows are padded on access.
    Tabular {
        columns: Vec<String>,
        rows: Vec<Vec<String>>,
    },
    /// One value per line.
    Lines(Vec<String>),
}

/// Which column holds the target value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ColumnResolution {
    Named { index: usize, name: String },
    FirstColumn,
}

impl ColumnResolution {
    pub fn index(&self) -> usize {
        match self {
            ColumnResolution::Named { index, .. } => *index,
            ColumnResolution::FirstColumn => 0,
        }
    }
}

/// Resolves the value column against the ordered candidate list. Header
/// names are compared trimmed and case-insensitively.
pub fn resolve_column(columns: &[String]) -> ColumnResolution {
    for candidate in CANDIDATE_COLUMNS {
        if let Some(index) = columns
            .iter()
            .position(|c| c.trim().eq_ignore_ascii_case(candidate))
        {
            return ColumnResolution::Named {
                index,
                name: candidate.to_string(),
            };
        }
    }
    ColumnResolution::FirstColumn
}

impl RecordShape {
    /// Raw values of the resolved column (or every line), in file order.
    pub fn into_values(self) -> Vec<String> {
        match self {
            RecordShape::Lines(lines) => lines,
            RecordShape::Tabular { columns, rows } => {
                if columns.is_empty() {
                    return Vec::new();
                }
                let index = resolve_column(&columns).index();
                rows.into_iter()
                    .map(|mut row| {
                        if index < row.len() {
                            row.swap_remove(index)
                        } else {
                            String::new()
                        }
                    })
                    .collect()
            }
        }
    }
}
