use smol_str::SmolStr;

use crate::position_map::{OutputLocation, PositionEntry, PositionMap, SourceLocation};

/// Vertical distance counts double: layout varies more along a line than across lines.
const VERTICAL_WEIGHT: f64 = 2.0;

/// Nearest-match lookups in both directions over one [`PositionMap`].
#[derive(Debug, Clone, Copy)]
pub struct SyncNavigator<'a> {
    map: &'a PositionMap,
}

impl<'a> SyncNavigator<'a> {
    pub fn new(map: &'a PositionMap) -> Self {
        Self { map }
    }

    /// Exact (line, column), then exact line, then the closest line in the same file.
    pub fn source_to_output(
        &self,
        file: &str,
        line: u32,
        column: Option<u32>,
    ) -> Option<OutputLocation> {
        let candidates = || self.map.entries().iter().filter(|e| same_file(&e.source.file, file));

        if let Some(column) = column {
            let exact = candidates()
                .find(|e| e.source.line == line && e.source.column == Some(column));
            if let Some(entry) = exact {
                return Some(entry.output);
            }
        }
        if let Some(entry) = candidates().find(|e| e.source.line == line) {
            return Some(entry.output);
        }
        candidates()
            .min_by_key(|e| e.source.line.abs_diff(line))
            .map(|e| e.output)
    }

    /// Closest entry on `page`; `None` when the page has no entries.
    pub fn output_to_source(&self, page: u32, x: f64, y: f64) -> Option<SourceLocation> {
        self.map
            .on_page(page)
            .map(|e| (distance(e, x, y), e))
            .min_by(|(a, _), (b, _)| a.total_cmp(b))
            .map(|(_, e)| e.source.clone())
    }
}

fn distance(entry: &PositionEntry, x: f64, y: f64) -> f64 {
    let dx = entry.output.x - x;
    let dy = VERTICAL_WEIGHT * (entry.output.y - y);
    (dx * dx + dy * dy).sqrt()
}

/// `main.tex` matches `/workdir/main.tex` and the other way round.
fn same_file(entry_file: &SmolStr, wanted: &str) -> bool {
    let entry_file = entry_file.as_str();
    entry_file == wanted || is_path_suffix(entry_file, wanted) || is_path_suffix(wanted, entry_file)
}

fn is_path_suffix(path: &str, suffix: &str) -> bool {
    !suffix.is_empty() && path.strip_suffix(suffix).is_some_and(|head| head.ends_with('/'))
}
