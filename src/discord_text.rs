//! Discord markdown to plain text.
//!
//! Window text concatenates `content_plain`, so formatting markers must not
//! leak into embeddings. Inline code and code blocks keep their content,
//! links degrade to `text (url)`.

use pulldown_cmark::{Event, Options, Parser, Tag, TagEnd};

pub fn markdown_to_plain(input: &str) -> String {
    let mut options = Options::empty();
    options.insert(Options::ENABLE_STRIKETHROUGH);
    options.insert(Options::ENABLE_TASKLISTS);

    let parser = Parser::new_ext(input, options);
    let mut output = String::new();
    let mut link_dest: Option<String> = None;
    let mut link_text_start = 0usize;

    for event in parser {
        match event {
            Event::Text(text) | Event::Code(text) => output.push_str(&text),
            Event::SoftBreak | Event::HardBreak => output.push('\n'),
            Event::Start(Tag::Link { dest_url, .. }) | Event::Start(Tag::Image { dest_url, .. }) => {
                link_dest = Some(dest_url.to_string());
                link_text_start = output.len();
            }
            Event::End(TagEnd::Link) | Event::End(TagEnd::Image) => {
                if let Some(dest) = link_dest.take() {
                    let text = output[link_text_start..].trim();
                    if text.is_empty() {
                        output.push_str(&dest);
                    } else if text != dest {
                        output.push_str(&format!(" ({})", dest));
                    }
                }
            }
            Event::End(TagEnd::Paragraph)
            | Event::End(TagEnd::Heading { .. })
            | Event::End(TagEnd::Item)
            | Event::End(TagEnd::CodeBlock)
            | Event::End(TagEnd::BlockQuote) => {
                if !output.ends_with('\n') {
                    output.push('\n');
                }
            }
            Event::TaskListMarker(checked) => {
                output.push_str(if checked { "[x] " } else { "[ ] " });
            }
            _ => {}
        }
    }

    output.trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::markdown_to_plain;

    #[test]
    fn strips_formatting_markers() {
        let input = "# Title\n\nSome **bold** and *italic* text.";
        let output = markdown_to_plain(input);
        assert_eq!(output, "Title\nSome bold and italic text.");
    }

    #[test]
    fn keeps_code_content() {
        let input = "Inline `code` and:\n```rust\nfn main() {}\n```";
        let output = markdown_to_plain(input);
        assert!(output.contains("Inline code"));
        assert!(output.contains("fn main() {}"));
        assert!(!output.contains("```"));
    }

    #[test]
    fn degrades_links_to_text_and_url() {
        let input = "[Rust](https://www.rust-lang.org)";
        let output = markdown_to_plain(input);
        assert_eq!(output, "Rust (https://www.rust-lang.org)");
    }

    #[test]
    fn plain_text_passes_through() {
        assert_eq!(markdown_to_plain("こんにちは、世界"), "こんにちは、世界");
    }
}
