//! Just enough PDF to count pages of backend output and to write plain-text
//! previews for the draft engine.

use std::fmt::Write as _;
use std::io::Read;
use std::ops::Range;

use flate2::read::ZlibDecoder;

const PAGE_WIDTH: u32 = 612;
const PAGE_HEIGHT: u32 = 792;
const FONT_SIZE: u32 = 11;
const LEADING: u32 = 14;
const LEFT: u32 = 72;
const TOP: u32 = 720;

/// Number of pages in a PDF byte stream, `0` if none can be found.
///
/// PDF 1.5 writers (pdfTeX, XeTeX) pack the page tree into compressed object
/// streams, so those are inflated and searched as well.
pub fn page_count(pdf: &[u8]) -> u32 {
    let streams = object_streams(pdf);

    let leaves = count_page_objects(pdf)
        + streams.iter().map(|s| count_page_objects(s)).sum::<u32>();
    if leaves > 0 {
        return leaves;
    }
    root_count(pdf)
        .or_else(|| streams.iter().find_map(|s| root_count(s)))
        .unwrap_or(0)
}

/// Inflated contents of every compressed `/Type /ObjStm` stream.
///
/// Uncompressed object streams are already visible in the raw bytes.
fn object_streams(pdf: &[u8]) -> Vec<Vec<u8>> {
    let mut streams = Vec::new();
    let mut offset = 0;

    while let Some(pos) = find(&pdf[offset..], b"/ObjStm") {
        let marker = offset + pos;
        offset = marker + b"/ObjStm".len();

        let header_end = object_start(pdf, marker);
        let Some((dictionary, data)) = stream_data(pdf, header_end) else {
            log::debug!("object stream at byte {} has no readable data", marker);
            continue;
        };
        if !dictionary.contains("/FlateDecode") {
            continue;
        }

        let mut inflated = Vec::new();
        match ZlibDecoder::new(&pdf[data]).read_to_end(&mut inflated) {
            Ok(_) => streams.push(inflated),
            Err(e) => log::debug!("cannot inflate object stream at byte {}: {}", marker, e),
        }
    }

    streams
}

/// End of the `N G obj` header that precedes `at`.
fn object_start(pdf: &[u8], at: usize) -> usize {
    pdf[..at]
        .windows(3)
        .rposition(|w| w == b"obj")
        .map_or(0, |pos| pos + 3)
}

/// The stream dictionary starting at `from` and the byte range of its body.
fn stream_data(pdf: &[u8], from: usize) -> Option<(String, Range<usize>)> {
    let keyword = from + find(&pdf[from..], b"stream")?;
    let dictionary = String::from_utf8_lossy(&pdf[from..keyword]).into_owned();

    let mut start = keyword + b"stream".len();
    if pdf.get(start) == Some(&b'\r') {
        start += 1;
    }
    if pdf.get(start) == Some(&b'\n') {
        start += 1;
    }

    let end = match direct_length(&dictionary) {
        Some(len) if start + len <= pdf.len() => start + len,
        _ => start + find(&pdf[start..], b"endstream")?,
    };
    Some((dictionary, start..end))
}

/// `/Length N` when given directly rather than as a reference.
fn direct_length(dictionary: &str) -> Option<usize> {
    let (_, rest) = dictionary.split_once("/Length")?;
    let rest = rest.trim_start();
    let digits = rest.find(|c: char| !c.is_ascii_digit()).unwrap_or(rest.len());
    let length = rest[..digits].parse().ok()?;

    // `/Length 12 0 R` points at another object
    let mut tail = rest[digits..].split_whitespace();
    match (tail.next(), tail.next()) {
        (Some(generation), Some(r))
            if generation.bytes().all(|b| b.is_ascii_digit()) && r.starts_with('R') =>
        {
            None
        }
        _ => Some(length),
    }
}

fn count_page_objects(pdf: &[u8]) -> u32 {
    let mut count = 0;
    for needle in [&b"/Type /Page"[..], &b"/Type/Page"[..]] {
        let mut offset = 0;
        while let Some(pos) = find(&pdf[offset..], needle) {
            let end = offset + pos + needle.len();
            // skip `/Pages`
            if pdf.get(end) != Some(&b's') {
                count += 1;
            }
            offset = end;
        }
    }
    count
}

fn root_count(pdf: &[u8]) -> Option<u32> {
    let pos = find(pdf, b"/Count")?;
    let digits: String = pdf[pos + b"/Count".len()..]
        .iter()
        .skip_while(|b| b.is_ascii_whitespace())
        .take_while(|b| b.is_ascii_digit())
        .map(|&b| b as char)
        .collect();
    digits.parse().ok()
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Writes one page per entry of `pages`, each line set in Helvetica.
pub fn write_text_document(pages: &[Vec<String>]) -> Vec<u8> {
    let pages: Vec<&[String]> = if pages.is_empty() {
        vec![&[][..]]
    } else {
        pages.iter().map(Vec::as_slice).collect()
    };

    // 1: catalog, 2: pages, 3: font, then a page/content pair per page
    let mut objects: Vec<String> = Vec::with_capacity(3 + pages.len() * 2);
    let kids: Vec<String> = (0..pages.len()).map(|i| format!("{} 0 R", 4 + i * 2)).collect();

    objects.push("<< /Type /Catalog /Pages 2 0 R >>".to_string());
    objects.push(format!(
        "<< /Type /Pages /Kids [{}] /Count {} >>",
        kids.join(" "),
        pages.len()
    ));
    objects.push("<< /Type /Font /Subtype /Type1 /BaseFont /Helvetica >>".to_string());

    for (i, lines) in pages.iter().enumerate() {
        let content = content_stream(lines);
        objects.push(format!(
            "<< /Type /Page /Parent 2 0 R /MediaBox [0 0 {PAGE_WIDTH} {PAGE_HEIGHT}] \
             /Resources << /Font << /F1 3 0 R >> >> /Contents {} 0 R >>",
            5 + i * 2
        ));
        objects.push(format!("<< /Length {} >>\nstream\n{}\nendstream", content.len(), content));
    }

    let mut out = String::from("%PDF-1.4\n");
    let mut offsets = Vec::with_capacity(objects.len());
    for (i, body) in objects.iter().enumerate() {
        offsets.push(out.len());
        let _ = write!(out, "{} 0 obj\n{}\nendobj\n", i + 1, body);
    }

    let xref = out.len();
    let _ = write!(out, "xref\n0 {}\n0000000000 65535 f \n", objects.len() + 1);
    for offset in offsets {
        let _ = write!(out, "{:010} 00000 n \n", offset);
    }
    let _ = write!(
        out,
        "trailer\n<< /Size {} /Root 1 0 R >>\nstartxref\n{}\n%%EOF\n",
        objects.len() + 1,
        xref
    );

    out.into_bytes()
}

fn content_stream(lines: &[String]) -> String {
    let mut stream = format!("BT /F1 {FONT_SIZE} Tf {LEADING} TL {LEFT} {TOP} Td");
    for line in lines {
        let _ = write!(stream, " ({}) Tj T*", escape(line));
    }
    stream.push_str(" ET");
    stream
}

fn escape(text: &str) -> String {
    text.chars()
        .filter(|c| c.is_ascii() && !c.is_ascii_control())
        .flat_map(|c| match c {
            '(' | ')' | '\\' => vec!['\\', c],
            _ => vec![c],
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn written_documents_count_their_pages() {
        let pages: Vec<Vec<String>> =
            vec![vec!["Hello".into()], vec!["World (again)".into()], vec![]];
        let pdf = write_text_document(&pages);
        assert!(pdf.starts_with(b"%PDF-1.4"));
        assert_eq!(page_count(&pdf), 3);
    }

    #[test]
    fn empty_input_still_produces_one_page() {
        assert_eq!(page_count(&write_text_document(&[])), 1);
    }

    #[test]
    fn compact_dictionaries_are_counted() {
        assert_eq!(page_count(b"<</Type/Pages/Count 2>> <</Type/Page>> <</Type/Page>>"), 2);
    }

    /// A PDF 1.5 body whose whole page tree sits in one deflated object stream.
    fn compressed_page_tree(pages: usize, length: Option<&str>) -> Vec<u8> {
        use flate2::Compression;
        use flate2::write::ZlibEncoder;
        use std::fmt::Write as _;
        use std::io::Write as _;

        let kids: Vec<String> = (0..pages).map(|i| format!("{} 0 R", 3 + i)).collect();
        let mut objects = vec![
            "<</Type/Catalog/Pages 2 0 R>>".to_string(),
            format!("<</Type/Pages/Kids[{}]/Count {}>>", kids.join(" "), pages),
        ];
        objects.extend((0..pages).map(|_| "<</Type/Page/Parent 2 0 R>>".to_string()));

        let mut index = String::new();
        let mut body = String::new();
        for (i, object) in objects.iter().enumerate() {
            let _ = write!(index, "{} {} ", i + 1, body.len());
            body.push_str(object);
            body.push(' ');
        }

        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(format!("{}{}", index, body).as_bytes()).unwrap();
        let compressed = encoder.finish().unwrap();

        let length = length.map_or_else(|| compressed.len().to_string(), str::to_string);
        let mut pdf = b"%PDF-1.5\n".to_vec();
        pdf.extend_from_slice(
            format!(
                "{} 0 obj\n<</Length {}/Filter/FlateDecode/Type/ObjStm/N {}/First {}>>\nstream\n",
                objects.len() + 1,
                length,
                objects.len(),
                index.len()
            )
            .as_bytes(),
        );
        pdf.extend_from_slice(&compressed);
        pdf.extend_from_slice(b"\nendstream\nendobj\nstartxref\n0\n%%EOF\n");
        pdf
    }

    #[test]
    fn pages_inside_compressed_object_streams_are_counted() {
        let pdf = compressed_page_tree(3, None);
        assert_eq!(count_page_objects(&pdf), 0);
        assert_eq!(root_count(&pdf), None);
        assert_eq!(page_count(&pdf), 3);
    }

    #[test]
    fn indirect_stream_length_reads_up_to_endstream() {
        assert_eq!(page_count(&compressed_page_tree(2, Some("9 0 R"))), 2);
    }

    #[test]
    fn stream_length_forms() {
        assert_eq!(direct_length("<</Length 120/Filter/FlateDecode>>"), Some(120));
        assert_eq!(direct_length("<< /Length 7 /Type /ObjStm >>"), Some(7));
        assert_eq!(direct_length("<< /Length 9 0 R >>"), None);
    }

    #[test]
    fn falls_back_to_root_count() {
        assert_eq!(page_count(b"<< /Count 7 >>"), 7);
        assert_eq!(page_count(b"not a pdf"), 0);
    }
}
