//! Literal-aware response line reader.
//!
//! `citm` never needs to fully parse a response originating at the
//! upstream server: `spec.md` §4.6 has the session run a "serverless
//! classifier" over just the tag and, for untagged responses, the first
//! keyword, routing on that alone. What it does need is to know *where one
//! response ends and the next begins* in a byte stream that may contain
//! IMAP literals (`{n}` / `{n+}` followed by exactly `n` raw bytes, which
//! can themselves contain CRLF). [`read_response_frame`] does exactly that
//! and nothing more; everything else is `str` splitting in
//! [`classify`].

/// A frame boundary found in `buf`, or a request for more bytes.
pub enum RawFrame {
    /// `buf[..consumed]` is one complete response (possibly spanning
    /// several literals); the caller drains that prefix.
    Complete(usize),
    /// Not enough bytes buffered yet to find the end of the frame.
    Incomplete,
}

/// Scans `buf` for the end of one complete response, accounting for
/// literal byte runs that may contain embedded CRLF.
pub fn read_response_frame(buf: &[u8]) -> RawFrame {
    let mut pos = 0usize;
    loop {
        let Some(eol) = find_crlf(&buf[pos..]) else {
            return RawFrame::Incomplete;
        };
        let line_end = pos + eol; // index of the '\r'
        let frame_end = line_end + 2; // past the '\r\n'

        match trailing_literal_len(&buf[pos..line_end]) {
            Some(len) => {
                let literal_end = frame_end + len;
                if buf.len() < literal_end {
                    return RawFrame::Incomplete;
                }
                // Keep scanning: the literal's bytes may be followed by
                // more text and another literal before the response ends.
                pos = literal_end;
            }
            None => return RawFrame::Complete(frame_end),
        }
    }
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}

/// If `line` ends with `{<digits>}` or `{<digits>+}`, returns the digit
/// value (the literal's byte length).
fn trailing_literal_len(line: &[u8]) -> Option<usize> {
    if *line.last()? != b'}' {
        return None;
    }
    let open = line.iter().rposition(|&b| b == b'{')?;
    let mut digits = &line[open + 1..line.len() - 1];
    if digits.last() == Some(&b'+') {
        digits = &digits[..digits.len() - 1];
    }
    if digits.is_empty() {
        return None;
    }
    std::str::from_utf8(digits).ok()?.parse().ok()
}

/// The tag discriminant of a response's first line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseTag {
    /// `* ...`
    Untagged,
    /// `+ ...`, a literal continuation request.
    Continuation,
    /// `<tag> ...`
    Tagged(String),
}

/// The coarse shape the session's classifier needs: which tag the response
/// carries, and, for untagged responses, the keyword right after `*`
/// (uppercased: `FETCH`, `EXISTS`, `EXPUNGE`, `VANISHED`, `FLAGS`,
/// `RECENT`, `LIST`, `LSUB`, `STATUS`, `SEARCH`, `CAPABILITY`, `ENABLED`,
/// `BYE`, `OK`, `NO`, `BAD`, `XKEYSYNC`, ...).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseHead {
    pub tag: ResponseTag,
    pub keyword: Option<String>,
}

/// If `frame`'s header line ends in a literal marker, returns the
/// literal's payload bytes (the PEM body of an `* XKEYSYNC CREATED {n}`
/// line, for instance). `frame` is a complete frame as produced by
/// [`read_response_frame`].
pub fn literal_payload(frame: &[u8]) -> Option<&[u8]> {
    let line_end = find_crlf(frame)?;
    let len = trailing_literal_len(&frame[..line_end])?;
    let start = line_end + 2;
    frame.get(start..start + len)
}

/// Classifies one complete response frame (as produced by
/// [`read_response_frame`]) into its tag and leading keyword, without
/// attempting to parse anything past that.
pub fn classify(frame: &[u8]) -> ResponseHead {
    let line_end = find_crlf(frame).unwrap_or(frame.len());
    let line = String::from_utf8_lossy(&frame[..line_end]);
    let mut words = line.split_whitespace();

    let first = words.next().unwrap_or("");
    let tag = match first {
        "*" => ResponseTag::Untagged,
        "+" => ResponseTag::Continuation,
        other => ResponseTag::Tagged(other.to_string()),
    };
    let keyword = words.next().map(|w| w.to_ascii_uppercase());

    ResponseHead { tag, keyword }
}
