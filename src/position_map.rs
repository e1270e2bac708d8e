//! Source ↔ output position maps.
//!
//! A map is either parsed from SyncTeX data the compiler wrote, or estimated
//! from the document structure when no such data exists.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use smol_str::SmolStr;

use crate::parser;

const HEURISTIC_LEFT_MARGIN: f64 = 0.1;
const HEURISTIC_TEXT_WIDTH: f64 = 0.8;
const MIN_LINE_HEIGHT: f64 = 0.005;
const MAX_LINE_HEIGHT: f64 = 0.05;

/// TeX places the page origin one inch from the top left corner.
const TEX_ORIGIN_BP: f64 = 72.0;
const SP_PER_PT: f64 = 65536.0;
const BP_PER_PT: f64 = 72.0 / 72.27;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SourceLocation {
    pub file: SmolStr,
    pub line: u32,
    pub column: Option<u32>,
}

/// A point on a page. `x`, `y`, `width` and `height` are fractions of the page.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OutputLocation {
    pub page: u32,
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionEntry {
    pub source: SourceLocation,
    pub output: OutputLocation,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionMap {
    entries: Vec<PositionEntry>,
    is_heuristic: bool,
    total_pages: u32,
}

impl PositionMap {
    pub fn entries(&self) -> &[PositionEntry] {
        &self.entries
    }

    pub fn is_heuristic(&self) -> bool {
        self.is_heuristic
    }

    pub fn total_pages(&self) -> u32 {
        self.total_pages
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn on_page(&self, page: u32) -> impl Iterator<Item = &PositionEntry> {
        self.entries.iter().filter(move |e| e.output.page == page)
    }
}

/// Page size in big points, used to normalize SyncTeX coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PageGeometry {
    pub width: f64,
    pub height: f64,
}

impl Default for PageGeometry {
    /// US Letter.
    fn default() -> Self {
        Self { width: 612.0, height: 792.0 }
    }
}

#[derive(Debug, Clone, Default)]
pub struct PositionMapBuilder {
    geometry: PageGeometry,
}

impl PositionMapBuilder {
    pub fn new(geometry: PageGeometry) -> Self {
        Self { geometry }
    }

    /// Prefers SyncTeX data; falls back to the heuristic when it is missing or yields nothing.
    pub fn build(
        &self,
        file: &str,
        source: &str,
        total_pages: u32,
        synctex: Option<&str>,
    ) -> PositionMap {
        if let Some(data) = synctex {
            let map = self.from_synctex(data, total_pages);
            if !map.is_empty() {
                log::debug!(
                    "{}: {} synctex entries over {} pages",
                    file,
                    map.entries.len(),
                    map.total_pages
                );
                return map;
            }
            log::warn!("{}: synctex data had no usable records, estimating positions", file);
        }
        heuristic(file, source, total_pages)
    }

    pub fn from_synctex(&self, data: &str, total_pages: u32) -> PositionMap {
        SynctexParser::new(self.geometry).parse(data, total_pages)
    }
}

fn marker_weight(command: &parser::Command<'_>) -> Option<f64> {
    match command.name {
        "newpage" | "clearpage" | "cleardoublepage" | "pagebreak" => Some(3.0),
        "part" | "chapter" | "section" => Some(3.0),
        "subsection" => Some(1.5),
        "subsubsection" | "paragraph" => Some(1.0),
        "[" => Some(0.5),
        "begin" => match command.argument?.trim_end_matches('*') {
            "figure" | "table" => Some(1.0),
            "equation" | "align" | "gather" | "multline" | "displaymath" | "eqnarray" => Some(0.5),
            _ => None,
        },
        _ => None,
    }
}

/// Estimates positions from structure alone. Pure and monotonic in line number.
pub fn heuristic(file: &str, source: &str, total_pages: u32) -> PositionMap {
    let total_pages = total_pages.max(1);
    let line_count = (source.lines().count() as u32).max(1);

    let mut markers: BTreeMap<u32, f64> = BTreeMap::new();
    for command in parser::commands(source) {
        if let Some(weight) = marker_weight(&command) {
            let slot = markers.entry(command.line).or_insert(0.0);
            *slot = slot.max(weight);
        }
    }

    let starts = page_starts(&markers, line_count, total_pages);
    let file = SmolStr::new(file);

    let entries = (1..=line_count)
        .map(|line| {
            let index = starts.partition_point(|&start| start <= line).max(1);
            let page_start = starts[index - 1];
            let page_end = starts.get(index).map_or(line_count, |next| next - 1);
            let lines_in_page = f64::from(page_end - page_start + 1);

            PositionEntry {
                source: SourceLocation { file: file.clone(), line, column: None },
                output: OutputLocation {
                    page: index as u32,
                    x: HEURISTIC_LEFT_MARGIN,
                    y: f64::from(line - page_start) / lines_in_page,
                    width: HEURISTIC_TEXT_WIDTH,
                    height: (1.0 / lines_in_page).clamp(MIN_LINE_HEIGHT, MAX_LINE_HEIGHT),
                },
            }
        })
        .collect();

    PositionMap {
        entries,
        is_heuristic: true,
        total_pages,
    }
}

/// First source line of every page, strictly increasing, starting at 1.
fn page_starts(markers: &BTreeMap<u32, f64>, line_count: u32, total_pages: u32) -> Vec<u32> {
    let mut starts = vec![1];
    let wanted = (total_pages - 1) as usize;
    if wanted == 0 {
        return starts;
    }

    let total_weight: f64 = markers.values().sum();
    if total_weight > 0.0 {
        let threshold = total_weight / f64::from(total_pages);
        let mut accumulated = 0.0;
        for (&line, &weight) in markers {
            if starts.len() > wanted {
                break;
            }
            // the marker that follows a crossing opens the next page
            let crossed = accumulated >= threshold * starts.len() as f64;
            if crossed && starts.last().is_some_and(|&last| line > last) {
                starts.push(line);
            }
            accumulated += weight;
        }
    }

    // split whatever is left after the last placed break evenly
    let remaining = wanted + 1 - starts.len();
    if remaining > 0 {
        let tail_start = starts.last().copied().unwrap_or(1);
        let tail_len = u64::from(line_count - tail_start + 1);
        for i in 1..=remaining as u64 {
            let line = tail_start + (i * tail_len / (remaining as u64 + 1)) as u32;
            if starts.last().is_some_and(|&last| line > last) && line <= line_count {
                starts.push(line);
            }
        }
    }

    starts
}

#[derive(Debug)]
struct SynctexParser {
    geometry: PageGeometry,
    inputs: HashMap<u32, SmolStr>,
    unit: f64,
    magnification: f64,
    x_offset: f64,
    y_offset: f64,
}

impl SynctexParser {
    fn new(geometry: PageGeometry) -> Self {
        Self {
            geometry,
            inputs: HashMap::new(),
            unit: 1.0,
            magnification: 1000.0,
            x_offset: 0.0,
            y_offset: 0.0,
        }
    }

    fn parse(mut self, data: &str, total_pages: u32) -> PositionMap {
        let mut entries = Vec::new();
        let mut page: Option<u32> = None;
        let mut skipped = 0usize;

        for line in data.lines() {
            let line = line.trim_end();
            if let Some(rest) = line.strip_prefix("Input:") {
                if let Some((tag, path)) = rest.split_once(':') {
                    match tag.parse() {
                        Ok(tag) => {
                            self.inputs.insert(tag, normalize_input(path));
                        }
                        Err(_) => skipped += 1,
                    }
                }
                continue;
            }
            if let Some(value) = line.strip_prefix("Unit:") {
                self.unit = value.trim().parse().unwrap_or(self.unit);
                continue;
            }
            if let Some(value) = line.strip_prefix("Magnification:") {
                self.magnification = value.trim().parse().unwrap_or(self.magnification);
                continue;
            }
            if let Some(value) = line.strip_prefix("X Offset:") {
                self.x_offset = value.trim().parse().unwrap_or(self.x_offset);
                continue;
            }
            if let Some(value) = line.strip_prefix("Y Offset:") {
                self.y_offset = value.trim().parse().unwrap_or(self.y_offset);
                continue;
            }
            if let Some(number) = line.strip_prefix('{') {
                page = number.parse().ok();
                continue;
            }
            if line.starts_with('}') {
                page = None;
                continue;
            }

            let Some(current) = page else { continue };
            // pages the output does not have
            if total_pages > 0 && current > total_pages {
                if is_record(line) {
                    skipped += 1;
                }
                continue;
            }
            if is_record(line) {
                match self.record(&line[1..], current) {
                    Some(entry) => entries.push(entry),
                    None => skipped += 1,
                }
            }
        }

        if skipped > 0 {
            log::debug!("skipped {} malformed synctex records", skipped);
        }

        // an unknown page count (0) is taken from the records
        let total_pages = match total_pages {
            0 => entries.iter().map(|e: &PositionEntry| e.output.page).max().unwrap_or(1),
            known => known,
        };
        PositionMap {
            entries,
            is_heuristic: false,
            total_pages,
        }
    }

    /// `tag,line[,column]:x,y[:W[,H,D]]`
    fn record(&self, body: &str, page: u32) -> Option<PositionEntry> {
        let mut parts = body.split(':');
        let link = parts.next()?;
        let point = parts.next()?;
        let size = parts.next();

        let mut link = link.split(',');
        let tag: u32 = link.next()?.parse().ok()?;
        let line: i64 = link.next()?.parse().ok()?;
        let column = link.next().and_then(|c| c.parse::<i64>().ok()).filter(|&c| c > 0);
        if line <= 0 || page == 0 {
            return None;
        }
        let file = self.inputs.get(&tag)?.clone();

        let (x, y) = point.split_once(',')?;
        let x = self.to_bp(x.parse().ok()?, self.x_offset) + TEX_ORIGIN_BP;
        let y = self.to_bp(y.parse().ok()?, self.y_offset) + TEX_ORIGIN_BP;

        let (width, height) = match size {
            Some(size) => {
                let dims: Vec<f64> =
                    size.split(',').map(|d| d.parse().ok()).collect::<Option<_>>()?;
                let width = dims.first().map_or(0.0, |&w| self.to_bp(w.abs(), 0.0));
                let height = match dims.as_slice() {
                    [_, h, d] => self.to_bp(h.abs() + d.abs(), 0.0),
                    _ => 0.0,
                };
                (width, height)
            }
            None => (0.0, 0.0),
        };

        Some(PositionEntry {
            source: SourceLocation {
                file,
                line: u32::try_from(line).ok()?,
                column: column.and_then(|c| u32::try_from(c).ok()),
            },
            output: OutputLocation {
                page,
                x: (x / self.geometry.width).clamp(0.0, 1.0),
                y: (y / self.geometry.height).clamp(0.0, 1.0),
                width: (width / self.geometry.width).clamp(0.0, 1.0),
                height: (height / self.geometry.height).clamp(0.0, 1.0),
            },
        })
    }

    fn to_bp(&self, value: f64, offset: f64) -> f64 {
        (value * self.unit + offset) / SP_PER_PT * BP_PER_PT * self.magnification / 1000.0
    }
}

fn is_record(line: &str) -> bool {
    matches!(line.chars().next(), Some('[' | '(' | 'h' | 'v' | 'x' | 'k' | 'g' | '$'))
}

fn normalize_input(path: &str) -> SmolStr {
    let path = path.trim();
    let path = path.strip_prefix("./").unwrap_or(path);
    SmolStr::new(path.replace("/./", "/"))
}
