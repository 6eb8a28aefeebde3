//! Media type detection from content bytes.
//!
//! Detection looks at a bounded prefix of the content. Binary formats are
//! matched against a table of well-known signatures, and ZIP containers are
//! refined by their leading entries (OOXML, OpenDocument, EPUB, JAR). Text is
//! refined by its structure: markup, JSON and delimited tables. Anything else
//! is reported as UTF-8 text when it decodes cleanly, and as
//! `application/octet-stream` otherwise.

/// Fallback for binary content without a known signature.
pub const OCTET_STREAM: &str = "application/octet-stream";

/// Media type reported for plain UTF-8 text.
pub const TEXT_PLAIN: &str = "text/plain; charset=utf-8";

/// ZIP archives whose entries do not identify a more specific format.
pub const ZIP: &str = "application/zip";

/// How many leading bytes are inspected.
pub const SNIFF_LEN: usize = 3072;

struct Signature {
    offset: usize,
    magic: &'static [u8],
    media_type: &'static str,
}

const fn sig(offset: usize, magic: &'static [u8], media_type: &'static str) -> Signature {
    Signature {
        offset,
        magic,
        media_type,
    }
}

// Order matters: more specific signatures come before their container formats.
const SIGNATURES: &[Signature] = &[
    sig(0, b"\x89PNG\r\n\x1a\n", "image/png"),
    sig(0, b"\xff\xd8\xff", "image/jpeg"),
    sig(0, b"GIF87a", "image/gif"),
    sig(0, b"GIF89a", "image/gif"),
    sig(0, b"BM", "image/bmp"),
    sig(0, b"II*\x00", "image/tiff"),
    sig(0, b"MM\x00*", "image/tiff"),
    sig(0, b"\x00\x00\x01\x00", "image/x-icon"),
    sig(0, b"%PDF-", "application/pdf"),
    sig(0, b"PK\x03\x04", ZIP),
    sig(0, b"PK\x05\x06", ZIP),
    sig(0, b"\x1f\x8b", "application/gzip"),
    sig(0, b"BZh", "application/x-bzip2"),
    sig(0, b"\xfd7zXZ\x00", "application/x-xz"),
    sig(0, b"7z\xbc\xaf\x27\x1c", "application/x-7z-compressed"),
    sig(0, b"Rar!\x1a\x07", "application/x-rar-compressed"),
    sig(0, b"\x28\xb5\x2f\xfd", "application/zstd"),
    sig(257, b"ustar", "application/x-tar"),
    sig(0, b"\x7fELF", "application/x-elf"),
    sig(0, b"\x00asm", "application/wasm"),
    sig(0, b"SQLite format 3\x00", "application/vnd.sqlite3"),
    sig(0, b"ID3", "audio/mpeg"),
    sig(0, b"OggS", "audio/ogg"),
    sig(0, b"fLaC", "audio/flac"),
    sig(4, b"ftypqt", "video/quicktime"),
    sig(4, b"ftyp", "video/mp4"),
    sig(0, b"\x1a\x45\xdf\xa3", "video/webm"),
];

/// Detect the media type of `data`.
pub fn sniff(data: &[u8]) -> &'static str {
    let head = &data[..data.len().min(SNIFF_LEN)];
    let truncated = data.len() > head.len();

    if let Some(riff) = sniff_riff(head) {
        return riff;
    }

    for signature in SIGNATURES {
        let end = signature.offset + signature.magic.len();
        if head.len() >= end && &head[signature.offset..end] == signature.magic {
            if signature.media_type == ZIP {
                return sniff_zip(head).unwrap_or(ZIP);
            }
            return signature.media_type;
        }
    }

    match decode_text(head, truncated) {
        Some(text) => sniff_text(text, truncated),
        None => OCTET_STREAM,
    }
}

/// RIFF containers share a prefix; the form type at offset 8 decides.
fn sniff_riff(head: &[u8]) -> Option<&'static str> {
    if head.len() < 12 || &head[..4] != b"RIFF" {
        return None;
    }
    match &head[8..12] {
        b"WEBP" => Some("image/webp"),
        b"WAVE" => Some("audio/wav"),
        b"AVI " => Some("video/x-msvideo"),
        _ => None,
    }
}

const LOCAL_HEADER: &[u8] = b"PK\x03\x04";
const LOCAL_HEADER_LEN: usize = 30;
/// General purpose flag: sizes live in a descriptor after the entry data.
const DATA_DESCRIPTOR_FLAG: u16 = 0x0008;

const DOCX: &str = "application/vnd.openxmlformats-officedocument.wordprocessingml.document";
const XLSX: &str = "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet";
const PPTX: &str = "application/vnd.openxmlformats-officedocument.presentationml.presentation";
const JAR: &str = "application/java-archive";

/// Formats that name themselves in a leading stored `mimetype` entry.
const SELF_DESCRIBED: &[&str] = &[
    "application/vnd.oasis.opendocument.text",
    "application/vnd.oasis.opendocument.spreadsheet",
    "application/vnd.oasis.opendocument.presentation",
    "application/vnd.oasis.opendocument.graphics",
    "application/vnd.oasis.opendocument.formula",
    "application/epub+zip",
];

/// Walk the local file headers inside the prefix looking for an entry that
/// identifies the archive.
fn sniff_zip(head: &[u8]) -> Option<&'static str> {
    let mut offset = 0usize;
    let mut first = true;

    while let Some(header) = head.get(offset..offset.saturating_add(LOCAL_HEADER_LEN)) {
        if &header[..4] != LOCAL_HEADER {
            break;
        }
        let flags = read_u16(header, 6);
        let compressed = read_u32(header, 18) as usize;
        let name_len = usize::from(read_u16(header, 26));
        let extra_len = usize::from(read_u16(header, 28));

        let name_start = offset + LOCAL_HEADER_LEN;
        let name = head.get(name_start..name_start + name_len)?;
        let data_start = name_start + name_len + extra_len;

        if first && name == b"mimetype" {
            let declared = head.get(data_start..data_start.saturating_add(compressed))?;
            let declared = declared.trim_ascii();
            return SELF_DESCRIBED
                .iter()
                .copied()
                .find(|t| t.as_bytes() == declared);
        }
        if let Some(kind) = zip_entry_kind(name) {
            return Some(kind);
        }

        offset = if flags & DATA_DESCRIPTOR_FLAG != 0 {
            let rest = head.get(data_start..)?;
            data_start + rest.windows(LOCAL_HEADER.len()).position(|w| w == LOCAL_HEADER)?
        } else {
            data_start.saturating_add(compressed)
        };
        first = false;
    }
    None
}

fn zip_entry_kind(name: &[u8]) -> Option<&'static str> {
    if name.starts_with(b"word/") {
        Some(DOCX)
    } else if name.starts_with(b"xl/") {
        Some(XLSX)
    } else if name.starts_with(b"ppt/") {
        Some(PPTX)
    } else if name == b"META-INF/MANIFEST.MF" {
        Some(JAR)
    } else {
        None
    }
}

fn read_u16(bytes: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([bytes[at], bytes[at + 1]])
}

fn read_u32(bytes: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
}

/// UTF-8 without control characters other than common whitespace.
///
/// When the prefix was truncated a multi-byte sequence may be cut in half, so
/// an incomplete trailing sequence is dropped rather than rejected.
fn decode_text(head: &[u8], truncated: bool) -> Option<&str> {
    let text = match std::str::from_utf8(head) {
        Ok(s) => s,
        Err(e) if truncated && e.error_len().is_none() => {
            std::str::from_utf8(&head[..e.valid_up_to()]).ok()?
        }
        Err(_) => return None,
    };
    text.chars()
        .all(|c| !c.is_control() || matches!(c, '\t' | '\n' | '\r' | '\x0c' | '\x1b'))
        .then_some(text)
}

fn sniff_text(text: &str, truncated: bool) -> &'static str {
    let trimmed = text.trim_start_matches('\u{feff}').trim_start();

    if trimmed.starts_with("{\\rtf") {
        return "text/rtf";
    }
    if trimmed.get(..4).is_some_and(|p| p.eq_ignore_ascii_case("%!ps")) {
        return "application/postscript";
    }
    if trimmed.starts_with('<') {
        if let Some(markup) = sniff_markup(trimmed) {
            return markup;
        }
    }
    if is_json(trimmed, truncated) {
        return "application/json";
    }
    if is_delimited(text, truncated, ',') {
        return "text/csv";
    }
    if is_delimited(text, truncated, '\t') {
        return "text/tab-separated-values";
    }
    TEXT_PLAIN
}

const HTML_TAGS: &[&str] = &[
    "<!doctype html",
    "<html",
    "<head",
    "<body",
    "<script",
    "<iframe",
    "<style",
    "<title",
    "<table",
    "<div",
    "<h1",
    "<p",
    "<a",
    "<br",
    "<b",
];

/// XML root elements with a registered media type of their own.
const XML_ROOTS: &[(&str, &str)] = &[
    ("svg", "image/svg+xml"),
    ("rss", "application/rss+xml"),
    ("feed", "application/atom+xml"),
    ("kml", "application/vnd.google-earth.kml+xml"),
    ("gpx", "application/gpx+xml"),
    ("x3d", "model/x3d+xml"),
];

fn sniff_markup(text: &str) -> Option<&'static str> {
    let lower = text.chars().take(32).collect::<String>().to_ascii_lowercase();
    let is_html = HTML_TAGS.iter().any(|tag| {
        lower.starts_with(tag)
            && matches!(lower.as_bytes().get(tag.len()), Some(b' ' | b'>' | b'\t' | b'\n' | b'\r'))
    });
    if is_html {
        return Some("text/html; charset=utf-8");
    }

    let rooted = xml_root(text).and_then(|root| {
        XML_ROOTS
            .iter()
            .find(|(name, _)| *name == root)
            .map(|(_, media_type)| *media_type)
    });
    if rooted.is_some() {
        return rooted;
    }
    if lower.starts_with("<?xml") {
        return Some("text/xml; charset=utf-8");
    }
    None
}

/// Local name of the first element, skipping the prolog, comments and
/// doctype.
fn xml_root(text: &str) -> Option<&str> {
    let mut rest = text;
    loop {
        rest = &rest[rest.find('<')?..];
        if let Some(after) = rest.strip_prefix("<!--") {
            rest = &after[after.find("-->")? + 3..];
        } else if rest.starts_with("<?") || rest.starts_with("<!") {
            rest = &rest[rest.find('>')? + 1..];
        } else {
            let name = &rest[1..];
            let end = name
                .find(|c: char| c.is_whitespace() || c == '>' || c == '/')
                .unwrap_or(name.len());
            let qualified = &name[..end];
            return Some(qualified.rsplit(':').next().unwrap_or(qualified));
        }
    }
}

/// A JSON object or array. A truncated prefix qualifies when it is valid so
/// far.
fn is_json(text: &str, truncated: bool) -> bool {
    if !text.starts_with(['{', '[']) {
        return false;
    }
    match serde_json::from_str::<serde::de::IgnoredAny>(text) {
        Ok(_) => true,
        Err(e) => truncated && e.is_eof(),
    }
}

/// At least two records with the same number of fields, two or more each.
fn is_delimited(text: &str, truncated: bool, delimiter: char) -> bool {
    let mut lines: Vec<&str> = text.lines().collect();
    if truncated {
        // The last record may be cut short.
        lines.pop();
    }
    while lines.last().is_some_and(|line| line.is_empty()) {
        lines.pop();
    }
    if lines.len() < 2 {
        return false;
    }

    let expected = count_fields(lines[0], delimiter);
    expected >= 2 && lines.iter().all(|line| count_fields(line, delimiter) == expected)
}

fn count_fields(line: &str, delimiter: char) -> usize {
    let mut fields = 1;
    let mut quoted = false;
    for c in line.chars() {
        if c == '"' {
            quoted = !quoted;
        } else if c == delimiter && !quoted {
            fields += 1;
        }
    }
    fields
}

/// Base of a media type: parameters stripped, trimmed and lowercased.
///
/// An empty value is treated as `application/octet-stream`.
pub fn base_type(media_type: &str) -> String {
    let base = media_type.split(';').next().unwrap_or_default().trim();
    if base.is_empty() {
        OCTET_STREAM.to_string()
    } else {
        base.to_ascii_lowercase()
    }
}

/// Whether a declared media type agrees with the detected one.
pub fn matches_declared(declared: &str, detected: &str) -> bool {
    base_type(declared) == base_type(detected)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sniff_known_signatures() {
        assert_eq!(sniff(b"\x89PNG\r\n\x1a\n\0\0\0\rIHDR"), "image/png");
        assert_eq!(sniff(b"%PDF-1.7\n%\xe2\xe3\xcf\xd3"), "application/pdf");
        assert_eq!(sniff(b"\xff\xd8\xff\xe0\0\x10JFIF"), "image/jpeg");
        assert_eq!(sniff(b"PK\x03\x04\x14\0\0\0"), "application/zip");
        assert_eq!(sniff(b"RIFF\0\0\0\0WEBPVP8 "), "image/webp");
        assert_eq!(sniff(b"\0\0\0\x18ftypmp42"), "video/mp4");
    }

    #[test]
    fn test_sniff_tar_at_offset() {
        let mut data = vec![0u8; 512];
        data[257..262].copy_from_slice(b"ustar");
        assert_eq!(sniff(&data), "application/x-tar");
    }

    #[test]
    fn test_sniff_text_variants() {
        assert_eq!(sniff(b"hello world\n"), TEXT_PLAIN);
        assert_eq!(sniff("héllo".as_bytes()), TEXT_PLAIN);
        assert_eq!(
            sniff(b"  <!DOCTYPE html><html></html>"),
            "text/html; charset=utf-8"
        );
        assert_eq!(sniff(b"<?xml version=\"1.0\"?>"), "text/xml; charset=utf-8");
        assert_eq!(sniff(b""), TEXT_PLAIN);
    }

    /// A stored ZIP local file header followed by its data.
    fn zip_entry(name: &str, data: &[u8], flags: u16) -> Vec<u8> {
        let size = if flags & DATA_DESCRIPTOR_FLAG != 0 {
            0
        } else {
            data.len() as u32
        };
        let mut out = LOCAL_HEADER.to_vec();
        out.extend_from_slice(&20u16.to_le_bytes());
        out.extend_from_slice(&flags.to_le_bytes());
        out.extend_from_slice(&0u16.to_le_bytes());
        out.extend_from_slice(&[0u8; 8]);
        out.extend_from_slice(&size.to_le_bytes());
        out.extend_from_slice(&size.to_le_bytes());
        out.extend_from_slice(&(name.len() as u16).to_le_bytes());
        out.extend_from_slice(&0u16.to_le_bytes());
        out.extend_from_slice(name.as_bytes());
        out.extend_from_slice(data);
        out
    }

    #[test]
    fn test_sniff_office_open_xml() {
        let mut docx = zip_entry("[Content_Types].xml", b"<?xml version=\"1.0\"?><Types/>", 0);
        docx.extend(zip_entry("_rels/.rels", b"<Relationships/>", 0));
        docx.extend(zip_entry("word/document.xml", b"<w:document/>", 0));
        assert_eq!(sniff(&docx), DOCX);

        let xlsx = zip_entry("xl/workbook.xml", b"<workbook/>", 0);
        assert_eq!(sniff(&xlsx), XLSX);

        let mut pptx = zip_entry("[Content_Types].xml", b"<Types/>", DATA_DESCRIPTOR_FLAG);
        pptx.extend(zip_entry("ppt/presentation.xml", b"<p:presentation/>", 0));
        assert_eq!(sniff(&pptx), PPTX);
    }

    #[test]
    fn test_sniff_self_described_archives() {
        let mut odt = zip_entry("mimetype", b"application/vnd.oasis.opendocument.text", 0);
        odt.extend(zip_entry("content.xml", b"<office:document-content/>", 0));
        assert_eq!(sniff(&odt), "application/vnd.oasis.opendocument.text");

        let epub = zip_entry("mimetype", b"application/epub+zip", 0);
        assert_eq!(sniff(&epub), "application/epub+zip");

        let unknown = zip_entry("mimetype", b"application/x-something", 0);
        assert_eq!(sniff(&unknown), ZIP);
    }

    #[test]
    fn test_sniff_plain_zip_and_jar() {
        let zip = zip_entry("notes/readme.txt", b"hello", 0);
        assert_eq!(sniff(&zip), ZIP);

        let jar = zip_entry("META-INF/MANIFEST.MF", b"Manifest-Version: 1.0\n", 0);
        assert_eq!(sniff(&jar), JAR);
    }

    #[test]
    fn test_sniff_json() {
        assert_eq!(sniff(br#"{"name": "vault", "tags": ["a"]}"#), "application/json");
        assert_eq!(sniff(b"  [1, 2, 3]\n"), "application/json");
        assert_eq!(sniff(b"{not json}"), TEXT_PLAIN);
        assert_eq!(sniff(b"[1, 2"), TEXT_PLAIN);
    }

    #[test]
    fn test_sniff_truncated_json_is_still_json() {
        let mut data = b"[".to_vec();
        while data.len() <= SNIFF_LEN {
            data.extend_from_slice(b"\"value\", ");
        }
        data.extend_from_slice(b"\"end\"]");
        assert_eq!(sniff(&data), "application/json");
    }

    #[test]
    fn test_sniff_delimited_tables() {
        assert_eq!(sniff(b"name,size\nreport.pdf,1024\n\"a, b\",7\n"), "text/csv");
        assert_eq!(sniff(b"name\tsize\r\nreport.pdf\t1024\r\n"), "text/tab-separated-values");
        assert_eq!(sniff(b"one line, with a comma\n"), TEXT_PLAIN);
        assert_eq!(sniff(b"a,b\nc,d,e\n"), TEXT_PLAIN);
    }

    #[test]
    fn test_sniff_xml_based_formats() {
        assert_eq!(
            sniff(b"<svg xmlns=\"http://www.w3.org/2000/svg\" width=\"10\"/>"),
            "image/svg+xml"
        );
        assert_eq!(
            sniff(
                b"<?xml version=\"1.0\"?>\n<!-- icon -->\n<!DOCTYPE svg>\n<svg:svg xmlns:svg=\"x\"/>"
            ),
            "image/svg+xml"
        );
        assert_eq!(
            sniff(b"<?xml version=\"1.0\"?><rss version=\"2.0\"></rss>"),
            "application/rss+xml"
        );
        assert_eq!(sniff(b"<?xml version=\"1.0\"?><note/>"), "text/xml; charset=utf-8");
        assert_eq!(sniff(b"<div class=\"x\">hi</div>"), "text/html; charset=utf-8");
        assert_eq!(sniff(b"{\\rtf1\\ansi hello}"), "text/rtf");
    }

    #[test]
    fn test_common_declared_types_are_accepted() {
        let cases: &[(&str, &[u8])] = &[
            ("application/json", br#"{"ok": true}"#),
            ("text/csv", b"a,b\n1,2\n"),
            ("image/svg+xml", b"<svg xmlns=\"http://www.w3.org/2000/svg\"/>"),
        ];
        for (declared, data) in cases {
            assert!(matches_declared(declared, sniff(data)), "{declared}");
        }
    }

    #[test]
    fn test_sniff_binary_fallback() {
        assert_eq!(sniff(&[0u8, 1, 2, 3, 0xff, 0xfe]), OCTET_STREAM);
    }

    #[test]
    fn test_truncated_utf8_is_still_text() {
        let mut data = "a".repeat(SNIFF_LEN - 1).into_bytes();
        data.extend_from_slice("é".as_bytes());
        assert_eq!(sniff(&data), TEXT_PLAIN);
    }

    #[test]
    fn test_base_type_and_matching() {
        assert_eq!(base_type("Text/Plain; charset=UTF-8"), "text/plain");
        assert_eq!(base_type(""), OCTET_STREAM);
        assert_eq!(base_type("  ;charset=x"), OCTET_STREAM);
        assert!(matches_declared("text/plain", TEXT_PLAIN));
        assert!(matches_declared("", sniff(&[0u8, 1])));
        assert!(!matches_declared("image/png", "application/pdf"));
    }
}
