#![forbid(unsafe_code)]

/// One decoded `multipart/form-data` part.
#[derive(Debug, Clone, PartialEq)]
pub struct MultipartPart {
	pub name: String,
	pub filename: Option<String>,
	pub content_type: Option<String>,
	pub data: Vec<u8>,
}

impl MultipartPart {
	pub fn is_file(&self) -> bool {
		self.filename.is_some()
	}

	pub fn text(&self) -> Option<String> {
		String::from_utf8(self.data.clone()).ok()
	}
}

/// Extract the boundary parameter from a `multipart/form-data` content type.
pub fn boundary_from_content_type(content_type: &str) -> Option<String> {
	let mut pieces = content_type.split(';');
	let kind = pieces.next()?.trim();
	if !kind.eq_ignore_ascii_case("multipart/form-data") {
		return None;
	}

	for piece in pieces {
		let piece = piece.trim();
		if let Some(value) = piece.strip_prefix("boundary=") {
			let value = value.trim_matches('"');
			if !value.is_empty() {
				return Some(value.to_string());
			}
		}
	}

	None
}

/// Parse a `multipart/form-data` body. Parts with no name are skipped;
/// a body without a terminal boundary is rejected. Inner boundaries must be
/// CRLF-preceded, so binary payloads containing the boundary text survive.
pub fn parse_multipart(boundary: &str, body: &[u8]) -> Result<Vec<MultipartPart>, String> {
	let opening = format!("--{boundary}");
	let separator = format!("\r\n--{boundary}");

	let mut parts = Vec::new();
	let mut pos = find(body, opening.as_bytes(), 0).ok_or("missing opening boundary")? + opening.len();

	loop {
		if body[pos..].starts_with(b"--") {
			// Terminal boundary.
			return Ok(parts);
		}

		// Boundary lines end with CRLF before the part begins.
		if !body[pos..].starts_with(b"\r\n") {
			return Err("malformed boundary line".to_string());
		}
		let part_start = pos + 2;

		let part_end = find(body, separator.as_bytes(), part_start).ok_or("missing closing boundary")?;

		if let Some(part) = parse_part(&body[part_start..part_end])? {
			parts.push(part);
		}

		pos = part_end + separator.len();
	}
}

fn parse_part(raw: &[u8]) -> Result<Option<MultipartPart>, String> {
	let header_end = find(raw, b"\r\n\r\n", 0).ok_or("part missing header terminator")?;
	let headers = String::from_utf8_lossy(&raw[..header_end]);
	let data = raw[header_end + 4..].to_vec();

	let mut name = None;
	let mut filename = None;
	let mut content_type = None;

	for line in headers.split("\r\n") {
		let Some((key, value)) = line.split_once(':') else {
			continue;
		};
		let key = key.trim().to_ascii_lowercase();
		let value = value.trim();

		if key == "content-disposition" {
			for attr in value.split(';') {
				let attr = attr.trim();
				if let Some(v) = attr.strip_prefix("name=") {
					name = Some(v.trim_matches('"').to_string());
				} else if let Some(v) = attr.strip_prefix("filename=") {
					filename = Some(v.trim_matches('"').to_string());
				}
			}
		} else if key == "content-type" {
			content_type = Some(value.to_string());
		}
	}

	let Some(name) = name.filter(|n| !n.is_empty()) else {
		return Ok(None);
	};

	Ok(Some(MultipartPart {
		name,
		filename,
		content_type,
		data,
	}))
}

fn find(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
	if needle.is_empty() || from > haystack.len() {
		return None;
	}
	haystack[from..]
		.windows(needle.len())
		.position(|window| window == needle)
		.map(|i| i + from)
}
