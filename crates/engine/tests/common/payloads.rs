//! Sample payloads with known sniffed media types.

/// Minimal PNG: signature plus the start of an IHDR chunk.
pub fn png(seed: u8) -> Vec<u8> {
    let mut data = b"\x89PNG\r\n\x1a\n\0\0\0\rIHDR".to_vec();
    data.extend(std::iter::repeat_n(seed, 64));
    data
}

pub fn pdf() -> Vec<u8> {
    b"%PDF-1.7\n%\xe2\xe3\xcf\xd3\n1 0 obj\n<< /Type /Catalog >>\nendobj\n".to_vec()
}

pub fn text(body: &str) -> Vec<u8> {
    body.as_bytes().to_vec()
}
