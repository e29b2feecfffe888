use std::sync::Arc;

use regex::Regex;
use scraper::{ElementRef, Html, Node, Selector};
use trawl_core::error::AppError;
use trawl_core::traits::{CleanedText, Cleaner};

/// Elements dropped together with everything inside them.
const SKIP_TAGS: &[&str] = &[
    "script", "style", "nav", "header", "footer", "aside", "noscript", "iframe", "svg", "form",
    "template", "button", "select", "canvas",
];

/// Elements that start a new line.
const BLOCK_TAGS: &[&str] = &[
    "p", "div", "section", "article", "main", "ul", "ol", "dl", "dt", "dd", "table", "thead",
    "tbody", "tr", "blockquote", "pre", "figure", "figcaption", "details", "summary", "address",
    "br", "hr",
];

const HEADING_TAGS: &[&str] = &["h1", "h2", "h3", "h4", "h5", "h6"];

/// Tried in order; the first match outside a noise element wins, else `<body>`.
const CONTAINER_SELECTORS: &[&str] = &[
    "main",
    "article",
    "[role=\"main\"]",
    ".main-content",
    ".article-content",
    ".post-content",
    ".entry-content",
    ".content",
    "#content",
    "#main",
];

/// Class/id tokens that mark ads, navigation and other page furniture.
const NOISE_ATTR_PATTERN: &str = r"(?i)(?:^|[\s_-])(?:ads?|advert\w*|sponsor\w*|promo\w*|nav|navbar|navigation|menu|sidebar|footer|header|social|share|sharing|comments?|related|recommend\w*|cookies?|consent|banner|newsletter|breadcrumbs?|popup|modal)(?:$|[\s_-])";

/// Boilerplate phrases removed from every line.
const JUNK_PATTERNS: &[&str] = &[
    r"(?i)accept (?:all )?cookies?.*?reject\w*",
    r"(?i)this (?:website|site) uses cookies.*?accept\w*",
    r"(?i)subscribe to our newsletter.*?sign up",
    r"(?i)follow us on.*?twitter",
    r"(?i)share this.*?facebook",
    r"(?i)\badvertisement\b",
    r"(?i)\bsponsored content\b",
];

/// Lines this short are dropped unless they are headings.
const MIN_LINE_CHARS: usize = 16;

const HEADING_PREFIX: &str = "## ";
const LIST_PREFIX: &str = "• ";

struct Rules {
    containers: Vec<Selector>,
    body: Selector,
    title: Selector,
    noise_attr: Regex,
    junk: Vec<Regex>,
}

/// HTML-to-text cleaner built on scraper.
///
/// Strips non-content elements by tag and by class/id, picks the main
/// content container, and flattens it into lines: headings as `## `, list
/// items as `• `, paragraphs as plain lines.
#[derive(Clone)]
pub struct HtmlTextCleaner {
    rules: Arc<Rules>,
}

impl HtmlTextCleaner {
    pub fn new() -> Result<Self, AppError> {
        let parse = |css: &str| {
            Selector::parse(css)
                .map_err(|e| AppError::CleanerError(format!("bad selector '{css}': {e}")))
        };
        let regex = |pattern: &str| {
            Regex::new(pattern)
                .map_err(|e| AppError::CleanerError(format!("bad pattern '{pattern}': {e}")))
        };

        let rules = Rules {
            containers: CONTAINER_SELECTORS
                .iter()
                .map(|&css| parse(css))
                .collect::<Result<_, _>>()?,
            body: parse("body")?,
            title: parse("title")?,
            noise_attr: regex(NOISE_ATTR_PATTERN)?,
            junk: JUNK_PATTERNS
                .iter()
                .map(|&pattern| regex(pattern))
                .collect::<Result<_, _>>()?,
        };

        Ok(Self {
            rules: Arc::new(rules),
        })
    }

    fn is_noise(&self, element: &ElementRef<'_>) -> bool {
        let el = element.value();
        if SKIP_TAGS.contains(&el.name()) {
            return true;
        }
        [el.attr("class"), el.id()]
            .into_iter()
            .flatten()
            .any(|value| self.rules.noise_attr.is_match(value))
    }

    fn inside_noise(&self, element: &ElementRef<'_>) -> bool {
        element
            .ancestors()
            .filter_map(ElementRef::wrap)
            .any(|ancestor| self.is_noise(&ancestor))
    }

    fn container<'a>(&self, document: &'a Html) -> Option<ElementRef<'a>> {
        self.rules
            .containers
            .iter()
            .find_map(|selector| {
                document
                    .select(selector)
                    .find(|candidate| !self.inside_noise(candidate))
            })
            .or_else(|| document.select(&self.rules.body).next())
    }

    /// Flatten `root` into `out`. Must not recurse: nesting depth is
    /// attacker-controlled.
    fn walk<'a>(&self, root: ElementRef<'a>, out: &mut LineBuffer) {
        let mut stack: Vec<Step<'a>> = Vec::new();
        push_children(&mut stack, root);

        while let Some(step) = stack.pop() {
            let element = match step {
                Step::Text(text) => {
                    out.push_text(text);
                    continue;
                }
                Step::Close { start, prefix } => {
                    out.end_block(start, prefix);
                    continue;
                }
                Step::Open(element) => element,
            };
            if self.is_noise(&element) {
                continue;
            }

            let tag = element.value().name();
            let prefix = if HEADING_TAGS.contains(&tag) {
                Some(HEADING_PREFIX)
            } else if tag == "li" {
                Some(LIST_PREFIX)
            } else {
                None
            };

            if prefix.is_some() || BLOCK_TAGS.contains(&tag) {
                let start = out.start_block();
                stack.push(Step::Close { start, prefix });
            }
            push_children(&mut stack, element);
        }
    }

    fn tidy(&self, lines: Vec<String>) -> String {
        lines
            .into_iter()
            .filter_map(|line| {
                let line = self
                    .rules
                    .junk
                    .iter()
                    .fold(line, |acc, re| re.replace_all(&acc, "").into_owned());
                let line = collapse_whitespace(&line);
                let keep =
                    line.starts_with(HEADING_PREFIX) || line.chars().count() >= MIN_LINE_CHARS;
                keep.then_some(line)
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

impl Cleaner for HtmlTextCleaner {
    fn clean(&self, html: &str) -> Result<CleanedText, AppError> {
        let document = Html::parse_document(html);

        let title = document
            .select(&self.rules.title)
            .next()
            .map(|t| collapse_whitespace(&t.text().collect::<String>()))
            .filter(|t| !t.is_empty());

        let mut out = LineBuffer::default();
        if let Some(container) = self.container(&document) {
            self.walk(container, &mut out);
        }
        out.flush();

        Ok(CleanedText {
            title,
            text: self.tidy(out.lines),
        })
    }
}

/// Pending work in [`HtmlTextCleaner::walk`].
enum Step<'a> {
    Open(ElementRef<'a>),
    Text(&'a str),
    /// Ends the block opened at `start` in the line buffer.
    Close {
        start: usize,
        prefix: Option<&'static str>,
    },
}

/// Queue `element`'s children so they pop in document order.
fn push_children<'a>(stack: &mut Vec<Step<'a>>, element: ElementRef<'a>) {
    for child in element.children().rev() {
        match child.value() {
            Node::Text(text) => stack.push(Step::Text(&**text)),
            Node::Element(_) => {
                if let Some(child) = ElementRef::wrap(child) {
                    stack.push(Step::Open(child));
                }
            }
            _ => {}
        }
    }
}

/// Accumulates inline text and breaks it into lines at block boundaries.
#[derive(Default)]
struct LineBuffer {
    lines: Vec<String>,
    current: String,
}

impl LineBuffer {
    fn push_text(&mut self, text: &str) {
        self.current.push_str(text);
    }

    fn flush(&mut self) {
        let line = collapse_whitespace(&self.current);
        self.current.clear();
        if !line.is_empty() {
            self.lines.push(line);
        }
    }

    fn start_block(&mut self) -> usize {
        self.flush();
        self.lines.len()
    }

    fn end_block(&mut self, start: usize, prefix: Option<&str>) {
        self.flush();
        if let Some(prefix) = prefix
            && let Some(first) = self.lines.get_mut(start)
            && !first.starts_with(prefix)
        {
            first.insert_str(0, prefix);
        }
    }
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}
