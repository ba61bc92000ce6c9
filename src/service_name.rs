//! DNS-SD service name parsing (RFC 2782 / RFC 6763).
//!
//! A service name is a dotted label sequence of the form
//!
//! ```text
//! [<instance>.][<subtype>._sub.]<_application>.<_protocol>.<domain>
//! ```
//!
//! The underscore-prefixed labels are located by scanning right to left.
//! Exactly two markers (`_application._protocol`) or four markers
//! (`_subtype._sub._application._protocol`) are accepted.

use std::fmt;
use std::str::FromStr;

use hickory_proto::rr::Name;

use crate::error::{Error, Result};

/// Maximum length of a single DNS label in bytes.
const MAX_LABEL_LEN: usize = 63;

/// A parsed DNS-SD service name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServiceName {
    /// Raw label bytes, root label excluded.
    data: Vec<u8>,
    /// End offset of each label in `data`.
    ends: Vec<usize>,
    instance: Option<String>,
    /// End offset in `data` of the instance labels.
    instance_end: Option<usize>,
    sub_type: Option<String>,
    full_sub_type: Option<String>,
    service_type: String,
    full_type: String,
    application: String,
    protocol: String,
    domain: String,
}

impl ServiceName {
    /// Parse a presentation-format name such as `"My Printer._ipp._tcp.local."`.
    ///
    /// The text may use `\DDD` and `\c` escapes; unescaped bytes are taken
    /// verbatim (UTF-8 in, UTF-8 out).
    pub fn parse(text: &str) -> Result<Self> {
        let (data, ends) = split_labels(text)?;
        Self::from_labels(data, ends)
    }

    /// Build a service name from a wire-format name.
    pub fn from_name(name: &Name) -> Result<Self> {
        let mut data = Vec::with_capacity(name.len());
        let mut ends = Vec::with_capacity(name.num_labels() as usize);
        for label in name.iter() {
            data.extend_from_slice(label);
            ends.push(data.len());
        }
        Self::from_labels(data, ends)
    }

    fn from_labels(data: Vec<u8>, ends: Vec<usize>) -> Result<Self> {
        let count = ends.len();
        let label = |i: usize| label_at(&data, &ends, i);

        // markers[0] is the rightmost underscore label (the protocol).
        let mut markers = [0usize; 4];
        let mut found = 0usize;
        for i in (0..count).rev() {
            if label(i).first() == Some(&b'_') {
                if found == markers.len() {
                    return Err(invalid(&data, &ends, "more than 4 underscore labels"));
                }
                markers[found] = i;
                found += 1;
            }
        }

        if found != 2 && found != 4 {
            return Err(invalid(
                &data,
                &ends,
                "expected 2 or 4 underscore-prefixed labels",
            ));
        }

        let protocol_idx = markers[0];
        let leftmost = markers[found - 1];

        let text = |i: usize| {
            let mut s = String::with_capacity(label(i).len());
            escape_label(label(i), &mut s);
            s
        };
        let join = |from: usize, to: usize| {
            let mut s = String::new();
            for i in from..to {
                if i > from {
                    s.push('.');
                }
                escape_label(label(i), &mut s);
            }
            s
        };

        let protocol = text(protocol_idx);
        let application = text(markers[1]);
        let service_type = format!("{application}.{protocol}");
        let full_type = join(leftmost, protocol_idx + 1);

        let (sub_type, full_sub_type) = if found == 4 {
            (Some(text(markers[3])), Some(join(markers[3], markers[2] + 1)))
        } else {
            (None, None)
        };

        let mut domain = join(protocol_idx + 1, count);
        // Root-only domain renders as "."
        domain.push('.');

        // Instance labels are concatenated: the instance may have been split
        // across several labels on the wire.
        let instance_end = (leftmost > 0).then(|| ends[leftmost - 1]);
        let instance = instance_end.map(|end| String::from_utf8_lossy(&data[..end]).into_owned());

        Ok(Self {
            data,
            ends,
            instance,
            instance_end,
            sub_type,
            full_sub_type,
            service_type,
            full_type,
            application,
            protocol,
            domain,
        })
    }

    /// Service instance name, if any, as readable (unescaped) text.
    ///
    /// Bytes that are not valid UTF-8 are replaced with U+FFFD; use
    /// [`instance_bytes`](Self::instance_bytes) for the exact label bytes.
    pub fn instance(&self) -> Option<&str> {
        self.instance.as_deref()
    }

    /// Raw instance bytes, the instance labels concatenated.
    pub fn instance_bytes(&self) -> Option<&[u8]> {
        self.instance_end.map(|end| &self.data[..end])
    }

    /// Subtype label, e.g. `_printer`.
    pub fn sub_type(&self) -> Option<&str> {
        self.sub_type.as_deref()
    }

    /// Subtype including the `_sub` marker, e.g. `_printer._sub`.
    pub fn full_sub_type(&self) -> Option<&str> {
        self.full_sub_type.as_deref()
    }

    /// Service type, e.g. `_http._tcp`.
    pub fn service_type(&self) -> &str {
        &self.service_type
    }

    /// Service type including any subtype, e.g. `_printer._sub._http._tcp`.
    pub fn full_type(&self) -> &str {
        &self.full_type
    }

    /// Application protocol label, e.g. `_http`.
    pub fn application(&self) -> &str {
        &self.application
    }

    /// Transport protocol label, e.g. `_tcp`.
    pub fn protocol(&self) -> &str {
        &self.protocol
    }

    /// Domain with trailing dot, e.g. `local.`.
    pub fn domain(&self) -> &str {
        &self.domain
    }

    /// Iterate over the raw label bytes, root excluded.
    pub fn labels(&self) -> impl Iterator<Item = &[u8]> + '_ {
        let mut start = 0;
        self.ends.iter().map(move |&end| {
            let label = &self.data[start..end];
            start = end;
            label
        })
    }

    /// Convert back into a fully qualified wire name.
    pub fn to_name(&self) -> Result<Name> {
        let mut name =
            Name::from_labels(self.labels()).map_err(|e| Error::Parse(e.to_string()))?;
        name.set_fqdn(true);
        Ok(name)
    }

    /// The service type as a browsable name (`_http._tcp.local.`).
    pub fn type_name(&self) -> String {
        format!("{}.{}", self.full_type, self.domain)
    }
}

impl fmt::Display for ServiceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = String::with_capacity(self.data.len() + self.ends.len() + 8);
        for label in self.labels() {
            escape_label(label, &mut s);
            s.push('.');
        }
        if s.is_empty() {
            s.push('.');
        }
        f.write_str(&s)
    }
}

impl FromStr for ServiceName {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<&Name> for ServiceName {
    type Error = Error;

    fn try_from(name: &Name) -> Result<Self> {
        Self::from_name(name)
    }
}

fn label_at<'a>(data: &'a [u8], ends: &[usize], i: usize) -> &'a [u8] {
    let start = if i == 0 { 0 } else { ends[i - 1] };
    &data[start..ends[i]]
}

fn invalid(data: &[u8], ends: &[usize], reason: &str) -> Error {
    let mut text = String::new();
    let mut start = 0;
    for &end in ends {
        escape_label(&data[start..end], &mut text);
        text.push('.');
        start = end;
    }
    Error::Parse(format!("invalid service name '{text}': {reason}"))
}

/// Append the presentation form of one label to `out`.
///
/// Bytes `<= 0x20` and `>= 0x7F` become `\DDD`; the characters
/// `" ( ) . ; \ @ $` are prefixed with a backslash.
pub fn escape_label(label: &[u8], out: &mut String) {
    for &b in label {
        match b {
            0x00..=0x20 | 0x7F..=0xFF => {
                out.push('\\');
                out.push((b'0' + b / 100) as char);
                out.push((b'0' + (b / 10) % 10) as char);
                out.push((b'0' + b % 10) as char);
            }
            b'"' | b'(' | b')' | b'.' | b';' | b'\\' | b'@' | b'$' => {
                out.push('\\');
                out.push(b as char);
            }
            _ => out.push(b as char),
        }
    }
}

/// Split presentation-format text into raw labels, resolving escapes.
///
/// A single trailing dot (the root) is accepted; empty interior labels are not.
pub fn parse_labels(text: &str) -> Result<Vec<Vec<u8>>> {
    let (data, ends) = split_labels(text)?;
    let mut labels = Vec::with_capacity(ends.len());
    let mut start = 0;
    for end in ends {
        labels.push(data[start..end].to_vec());
        start = end;
    }
    Ok(labels)
}

fn split_labels(text: &str) -> Result<(Vec<u8>, Vec<usize>)> {
    let bytes = text.as_bytes();
    let mut data = Vec::with_capacity(bytes.len());
    let mut ends = Vec::new();
    let mut label_start = 0usize;
    let mut i = 0usize;

    if text == "." {
        return Ok((data, ends));
    }

    while i < bytes.len() {
        match bytes[i] {
            b'\\' => {
                let rest = &bytes[i + 1..];
                match rest {
                    [a, b, c, ..] if a.is_ascii_digit() && b.is_ascii_digit() && c.is_ascii_digit() => {
                        let value =
                            u16::from(a - b'0') * 100 + u16::from(b - b'0') * 10 + u16::from(c - b'0');
                        if value > 0xFF {
                            return Err(Error::Parse(format!(
                                "escape \\{}{}{} out of range in '{text}'",
                                *a as char, *b as char, *c as char
                            )));
                        }
                        data.push(value as u8);
                        i += 4;
                    }
                    [c, ..] if !c.is_ascii_digit() => {
                        data.push(*c);
                        i += 2;
                    }
                    _ => {
                        return Err(Error::Parse(format!("dangling escape in '{text}'")));
                    }
                }
            }
            b'.' => {
                if data.len() == label_start {
                    return Err(Error::Parse(format!("empty label in '{text}'")));
                }
                ends.push(data.len());
                label_start = data.len();
                i += 1;
            }
            b => {
                data.push(b);
                i += 1;
            }
        }
        if data.len() - label_start > MAX_LABEL_LEN {
            return Err(Error::Parse(format!(
                "label longer than {MAX_LABEL_LEN} bytes in '{text}'"
            )));
        }
    }

    if data.len() > label_start {
        ends.push(data.len());
    }

    Ok((data, ends))
}
