/// One image candidate of a `srcset` attribute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub url: String,
    /// Width or density descriptor (`640w`, `2x`), possibly empty
    pub descriptor: String,
}

/// Splits a `srcset` value into candidates.
///
/// URLs may contain commas; a candidate URL ends at the first whitespace,
/// and trailing commas belong to the separator.
pub fn parse(value: &str) -> Vec<Candidate> {
    let mut candidates = Vec::new();
    let mut rest = value;

    loop {
        rest = rest.trim_start_matches(|c: char| c.is_whitespace() || c == ',');
        if rest.is_empty() {
            break;
        }

        let end = rest.find(char::is_whitespace).unwrap_or(rest.len());
        let (raw_url, tail) = rest.split_at(end);
        let url = raw_url.trim_end_matches(',');

        // A URL ending with a comma has no descriptor.
        let (descriptor, tail) = if url.len() < raw_url.len() {
            ("", tail)
        } else {
            let end = tail.find(',').unwrap_or(tail.len());
            (tail[..end].trim(), &tail[end..])
        };

        candidates.push(Candidate {
            url: url.to_string(),
            descriptor: descriptor.to_string(),
        });
        rest = tail;
    }

    candidates
}

pub fn render(candidates: &[Candidate]) -> String {
    candidates
        .iter()
        .map(|c| {
            if c.descriptor.is_empty() {
                c.url.clone()
            } else {
                format!("{} {}", c.url, c.descriptor)
            }
        })
        .collect::<Vec<_>>()
        .join(", ")
}
