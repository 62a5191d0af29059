/// Default chunk target in characters for prose.
pub const MARKDOWN_TARGET: usize = 1200;
/// Code window size and overlap in lines.
pub const CODE_WINDOW: usize = 60;
pub const CODE_OVERLAP: usize = 10;

/// Markdown-aware chunking: a new chunk starts at every heading, and
/// paragraphs are packed greedily up to the target size. Headings stay
/// attached to the text they introduce so citations read sensibly.
pub fn chunk_markdown(text: &str, target: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut current = String::new();

    for paragraph in text.split("\n\n") {
        let paragraph = paragraph.trim_end();
        if paragraph.trim().is_empty() {
            continue;
        }
        let is_heading = paragraph.trim_start().starts_with('#');
        let would_overflow = !current.is_empty() && current.len() + paragraph.len() + 2 > target;
        if (is_heading || would_overflow) && !current.is_empty() {
            chunks.push(std::mem::take(&mut current));
        }
        if !current.is_empty() {
            current.push_str("\n\n");
        }
        current.push_str(paragraph);

        // A pathological single paragraph larger than the target is split
        // hard so no chunk grows unbounded.
        while current.len() > target * 2 {
            let cut = current
                .char_indices()
                .take_while(|(i, _)| *i < target)
                .last()
                .map(|(i, c)| i + c.len_utf8())
                .unwrap_or(current.len());
            let head: String = current[..cut].to_string();
            current = current[cut..].to_string();
            chunks.push(head);
        }
    }
    if !current.trim().is_empty() {
        chunks.push(current);
    }
    chunks
}

/// Line-window chunking for source files: fixed-size windows with overlap
/// so a definition split at a boundary still appears whole in one chunk.
pub fn chunk_code(text: &str, window: usize, overlap: usize) -> Vec<String> {
    let lines: Vec<&str> = text.lines().collect();
    if lines.is_empty() {
        return Vec::new();
    }
    let step = window.saturating_sub(overlap).max(1);
    let mut chunks = Vec::new();
    let mut start = 0;
    while start < lines.len() {
        let end = (start + window).min(lines.len());
        let chunk = lines[start..end].join("\n");
        if !chunk.trim().is_empty() {
            chunks.push(chunk);
        }
        if end == lines.len() {
            break;
        }
        start += step;
    }
    chunks
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn headings_start_new_chunks() {
        let doc = "# Intro\n\nSome prose here.\n\n# Usage\n\nMore prose.";
        let chunks = chunk_markdown(doc, MARKDOWN_TARGET);
        assert_eq!(chunks.len(), 2);
        assert!(chunks[0].starts_with("# Intro"));
        assert!(chunks[1].starts_with("# Usage"));
        assert!(chunks[1].contains("More prose."));
    }

    #[test]
    fn paragraphs_pack_up_to_target() {
        let doc = "aaaa\n\nbbbb\n\ncccc";
        let chunks = chunk_markdown(doc, 11);
        // "aaaa\n\nbbbb" fits (10 chars), "cccc" overflows into chunk two.
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0], "aaaa\n\nbbbb");
        assert_eq!(chunks[1], "cccc");
    }

    #[test]
    fn giant_paragraph_is_hard_split() {
        let doc = "x".repeat(5000);
        let chunks = chunk_markdown(&doc, 1000);
        assert!(chunks.len() > 1);
        assert!(chunks.iter().all(|c| c.len() <= 2000));
        let total: usize = chunks.iter().map(|c| c.len()).sum();
        assert_eq!(total, 5000);
    }

    #[test]
    fn empty_input_gives_no_chunks() {
        assert!(chunk_markdown("", MARKDOWN_TARGET).is_empty());
        assert!(chunk_markdown("\n\n\n", MARKDOWN_TARGET).is_empty());
        assert!(chunk_code("", CODE_WINDOW, CODE_OVERLAP).is_empty());
    }

    #[test]
    fn code_windows_overlap() {
        let source: Vec<String> = (0..130).map(|i| format!("line {i}")).collect();
        let text = source.join("\n");
        let chunks = chunk_code(&text, 60, 10);
        assert_eq!(chunks.len(), 3);
        // Window two starts 50 lines in, repeating the last 10 of window one.
        assert!(chunks[0].ends_with("line 59"));
        assert!(chunks[1].starts_with("line 50"));
        assert!(chunks[2].ends_with("line 129"));
    }

    #[test]
    fn short_file_is_one_chunk() {
        let chunks = chunk_code("fn main() {}\n", CODE_WINDOW, CODE_OVERLAP);
        assert_eq!(chunks.len(), 1);
    }
}
