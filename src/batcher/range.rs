//! A1-notation range parsing for scope comparison
//!
//! Only the geometry matters here: which sheet, which rows, which columns.
//! Unbounded edges (`A:C`, `2:4`, a bare sheet name) extend to `u32::MAX`.

use once_cell::sync::Lazy;
use regex::Regex;
use std::fmt;

/// Upper bound used for open-ended rows or columns
const UNBOUNDED: u32 = u32::MAX;

static CELL_REF: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\$?([A-Za-z]{0,3})\$?([0-9]*)$").expect("cell reference pattern is valid")
});

/// Rectangular region of one sheet, 1-indexed and inclusive
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct GridRange {
    pub sheet: Option<String>,
    pub start_row: u32,
    pub end_row: u32,
    pub start_col: u32,
    pub end_col: u32,
}

#[derive(Debug, Clone, Copy)]
struct CellRef {
    col: Option<u32>,
    row: Option<u32>,
}

fn column_index(letters: &str) -> Option<u32> {
    if letters.is_empty() {
        return None;
    }
    letters.chars().try_fold(0u32, |acc, c| {
        let digit = c.to_ascii_uppercase() as u32 - 'A' as u32 + 1;
        acc.checked_mul(26)?.checked_add(digit)
    })
}

fn column_letters(mut index: u32) -> String {
    let mut letters = Vec::new();
    while index > 0 {
        let rem = (index - 1) % 26;
        letters.push((b'A' + rem as u8) as char);
        index = (index - 1) / 26;
    }
    letters.iter().rev().collect()
}

fn parse_cell(text: &str) -> Option<CellRef> {
    let caps = CELL_REF.captures(text.trim())?;
    let col = column_index(&caps[1]);
    let row = match &caps[2] {
        "" => None,
        digits => Some(digits.parse::<u32>().ok().filter(|r| *r > 0)?),
    };
    if col.is_none() && row.is_none() {
        return None;
    }
    Some(CellRef { col, row })
}

fn split_sheet(text: &str) -> (Option<String>, &str) {
    match text.rfind('!') {
        Some(idx) => {
            let sheet = text[..idx].trim();
            let sheet = sheet
                .strip_prefix('\'')
                .and_then(|s| s.strip_suffix('\''))
                .unwrap_or(sheet)
                .replace("''", "'");
            (Some(sheet), &text[idx + 1..])
        }
        None => (None, text),
    }
}

impl GridRange {
    /// Parse `Sheet1!A1:C5`, `'My Sheet'!B:B`, `3:7`, `A1`, or a bare sheet name
    ///
    /// Returns `None` when the text is not recognisable A1 notation.
    pub fn parse(text: &str) -> Option<Self> {
        let text = text.trim();
        if text.is_empty() {
            return None;
        }

        let (sheet, cells) = split_sheet(text);

        if cells.is_empty() {
            return None;
        }

        let (start, end) = match cells.split_once(':') {
            Some((a, b)) => (parse_cell(a), parse_cell(b)),
            None => match parse_cell(cells) {
                Some(cell) => (Some(cell), Some(cell)),
                // No '!' and not a cell: a whole-sheet reference
                None if sheet.is_none() && !CELL_REF.is_match(cells) => {
                    return Some(Self::whole_sheet(Some(cells.to_string())));
                }
                None => return None,
            },
        };
        let (start, end) = (start?, end?);

        let start_row = start.row.unwrap_or(1);
        let end_row = end.row.unwrap_or(UNBOUNDED);
        let start_col = start.col.unwrap_or(1);
        let end_col = end.col.unwrap_or(UNBOUNDED);

        Some(Self {
            sheet,
            start_row: start_row.min(end_row),
            end_row: start_row.max(end_row),
            start_col: start_col.min(end_col),
            end_col: start_col.max(end_col),
        })
    }

    pub fn whole_sheet(sheet: Option<String>) -> Self {
        Self {
            sheet,
            start_row: 1,
            end_row: UNBOUNDED,
            start_col: 1,
            end_col: UNBOUNDED,
        }
    }

    /// Whether the two ranges are on the same sheet, as far as can be told
    ///
    /// A range without a sheet prefix refers to the default sheet, whose name
    /// is unknown here, so it conservatively matches any sheet.
    fn may_share_sheet(&self, other: &GridRange) -> bool {
        match (&self.sheet, &other.sheet) {
            (Some(a), Some(b)) => a == b,
            _ => true,
        }
    }

    pub fn overlaps(&self, other: &GridRange) -> bool {
        self.may_share_sheet(other)
            && self.start_row <= other.end_row
            && other.start_row <= self.end_row
            && self.start_col <= other.end_col
            && other.start_col <= self.end_col
    }

    /// Contiguous along one axis with identical extent on the other
    pub fn is_adjacent(&self, other: &GridRange) -> bool {
        if self.sheet != other.sheet {
            return false;
        }

        let same_cols = self.start_col == other.start_col && self.end_col == other.end_col;
        let same_rows = self.start_row == other.start_row && self.end_row == other.end_row;

        let rows_touch = (self.end_row != UNBOUNDED && self.end_row + 1 == other.start_row)
            || (other.end_row != UNBOUNDED && other.end_row + 1 == self.start_row);
        let cols_touch = (self.end_col != UNBOUNDED && self.end_col + 1 == other.start_col)
            || (other.end_col != UNBOUNDED && other.end_col + 1 == self.start_col);

        (same_cols && rows_touch) || (same_rows && cols_touch)
    }

    /// Smallest range covering both
    pub fn span(&self, other: &GridRange) -> GridRange {
        GridRange {
            sheet: self.sheet.clone(),
            start_row: self.start_row.min(other.start_row),
            end_row: self.end_row.max(other.end_row),
            start_col: self.start_col.min(other.start_col),
            end_col: self.end_col.max(other.end_col),
        }
    }

    pub fn cell_count(&self) -> u64 {
        (self.end_row - self.start_row + 1) as u64 * (self.end_col - self.start_col + 1) as u64
    }
}

impl fmt::Display for GridRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rows_open = self.start_row == 1 && self.end_row == UNBOUNDED;
        let cols_open = self.start_col == 1 && self.end_col == UNBOUNDED;

        if let Some(sheet) = &self.sheet {
            let plain = sheet.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
            match (plain, rows_open && cols_open) {
                (true, true) => return f.write_str(sheet),
                (true, false) => write!(f, "{}!", sheet)?,
                (false, true) => return write!(f, "'{}'", sheet.replace('\'', "''")),
                (false, false) => write!(f, "'{}'!", sheet.replace('\'', "''"))?,
            }
        }

        match (rows_open, cols_open) {
            (true, true) => Ok(()),
            (true, false) => write!(
                f,
                "{}:{}",
                column_letters(self.start_col),
                column_letters(self.end_col)
            ),
            (false, true) => write!(f, "{}:{}", self.start_row, self.end_row),
            (false, false) => {
                let start = format!("{}{}", column_letters(self.start_col), self.start_row);
                if self.start_row == self.end_row && self.start_col == self.end_col {
                    f.write_str(&start)
                } else {
                    write!(
                        f,
                        "{}:{}{}",
                        start,
                        column_letters(self.end_col),
                        self.end_row
                    )
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn range(text: &str) -> GridRange {
        GridRange::parse(text).unwrap()
    }

    #[test]
    fn test_parse_forms() {
        let r = range("Sheet1!A1:C5");
        assert_eq!(r.sheet.as_deref(), Some("Sheet1"));
        assert_eq!((r.start_row, r.end_row, r.start_col, r.end_col), (1, 5, 1, 3));

        let r = range("'My Sheet'!B:B");
        assert_eq!(r.sheet.as_deref(), Some("My Sheet"));
        assert_eq!((r.start_col, r.end_col), (2, 2));
        assert_eq!(r.end_row, UNBOUNDED);

        let r = range("3:7");
        assert_eq!((r.start_row, r.end_row), (3, 7));
        assert_eq!(r.end_col, UNBOUNDED);

        let r = range("AA10");
        assert_eq!((r.start_row, r.start_col), (10, 27));

        let r = range("Summary");
        assert_eq!(r.sheet.as_deref(), Some("Summary"));
        assert_eq!(r.cell_count(), UNBOUNDED as u64 * UNBOUNDED as u64);

        assert!(GridRange::parse("").is_none());
        assert!(GridRange::parse("Sheet1!").is_none());
        assert!(GridRange::parse("A0").is_none());
    }

    #[test]
    fn test_reversed_corners_are_normalised() {
        assert_eq!(range("C5:A1"), range("A1:C5"));
    }

    #[test]
    fn test_overlaps() {
        assert!(range("A1:C3").overlaps(&range("C3:D4")));
        assert!(!range("A1:C3").overlaps(&range("D1:D3")));
        assert!(range("A:A").overlaps(&range("A100")));
        assert!(!range("Sheet1!A1").overlaps(&range("Sheet2!A1")));
        // Unqualified ranges may be on any sheet
        assert!(range("A1").overlaps(&range("Sheet2!A1")));
    }

    #[test]
    fn test_adjacency() {
        // Vertically stacked, same columns
        assert!(range("A1:C1").is_adjacent(&range("A2:C2")));
        assert!(range("A2:C2").is_adjacent(&range("A1:C1")));
        // Side by side, same rows
        assert!(range("A1:A5").is_adjacent(&range("B1:B5")));
        // Gap
        assert!(!range("A1:C1").is_adjacent(&range("A3:C3")));
        // Contiguous but different extents
        assert!(!range("A1:C1").is_adjacent(&range("A2:D2")));
        assert!(!range("Sheet1!A1").is_adjacent(&range("Sheet2!A2")));
    }

    #[test]
    fn test_display() {
        assert_eq!(range("sheet1!a1:c5").to_string(), "sheet1!A1:C5");
        assert_eq!(range("'Q1 Data'!B2").to_string(), "'Q1 Data'!B2");
        assert_eq!(range("A:C").to_string(), "A:C");
        assert_eq!(range("2:4").to_string(), "2:4");
        assert_eq!(range("Summary").to_string(), "Summary");
        assert_eq!(range("A1:C1").span(&range("A2:C2")).to_string(), "A1:C2");
    }
}
