// Minimal HTML page builder for the status page.
use std::fmt::Write;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Meta {
    pub name: String,
    pub content: String,
}

#[derive(Debug, Clone, Default)]
pub struct Page {
    title: String,
    style_sheets: Vec<String>,
    meta: Vec<Meta>,
    body: Vec<String>,
}

impl Page {
    pub fn new(title: impl Into<String>) -> Self {
        Page {
            title: title.into(),
            ..Default::default()
        }
    }

    /// Adding the same sheet twice is a no-op.
    pub fn add_style_sheet(&mut self, href: &str) {
        if !self.style_sheets.iter().any(|s| s == href) {
            self.style_sheets.push(href.to_string());
        }
    }

    /// Replaces the content of an existing entry with the same name.
    pub fn add_meta(&mut self, name: &str, content: &str) {
        match self.meta.iter_mut().find(|m| m.name == name) {
            Some(existing) => existing.content = content.to_string(),
            None => self.meta.push(Meta {
                name: name.to_string(),
                content: content.to_string(),
            }),
        }
    }

    /// Body text is escaped and wrapped in a paragraph.
    pub fn add_paragraph(&mut self, text: &str) {
        self.body.push(format!("<p>{}</p>", escape(text)));
    }

    pub fn render(&self) -> String {
        let mut out = String::from("<!DOCTYPE html>\n<html><head>\n");
        if !self.title.is_empty() {
            let _ = writeln!(out, "<title>{}</title>", escape(&self.title));
        }
        for m in &self.meta {
            let _ = writeln!(
                out,
                "<meta name=\"{}\" content=\"{}\"/>",
                escape(&m.name),
                escape(&m.content)
            );
        }
        for sheet in &self.style_sheets {
            let _ = writeln!(
                out,
                "<link type=\"text/css\" rel=\"stylesheet\" href=\"{}\"/>",
                escape(sheet)
            );
        }
        out.push_str("</head><body>\n");
        if !self.title.is_empty() {
            let _ = writeln!(out, "<h1>{}</h1>", escape(&self.title));
        }
        for block in &self.body {
            out.push_str(block);
            out.push('\n');
        }
        out.push_str("</body></html>\n");
        out
    }
}

fn escape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_head() {
        let mut page = Page::new("AFM");
        page.add_style_sheet("polaroid.css");
        page.add_style_sheet("polaroid.css");
        page.add_meta("viewport", "width=device-width");
        let html = page.render();

        assert!(html.contains("<title>AFM</title>"));
        assert_eq!(html.matches("polaroid.css").count(), 1);
        assert!(html.contains("<meta name=\"viewport\" content=\"width=device-width\"/>"));
        assert!(html.ends_with("</body></html>\n"));
    }

    #[test]
    fn test_meta_replaced_by_name() {
        let mut page = Page::default();
        page.add_meta("refresh", "30");
        page.add_meta("refresh", "10");
        let html = page.render();
        assert!(html.contains("content=\"10\""));
        assert!(!html.contains("content=\"30\""));
        assert!(!html.contains("<title>"));
    }

    #[test]
    fn test_body_is_escaped() {
        let mut page = Page::new("a & b");
        page.add_paragraph("<script>alert('x')</script>");
        let html = page.render();
        assert!(html.contains("<title>a &amp; b</title>"));
        assert!(html.contains("&lt;script&gt;alert(&#39;x&#39;)&lt;/script&gt;"));
        assert!(!html.contains("<script>alert"));
    }
}
