use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use anyhow::{Result, bail};
use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};

static HEADING_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\*+)[ \t]+(\S.*)$").expect("valid heading regex"));
static ORDERED_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\++)[ \t]+(\S.*)$").expect("valid ordered list regex"));
static UNORDERED_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(-+)[ \t]+(\S.*)$").expect("valid unordered list regex"));
static CODE_OPEN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\{code(?::([^}]*))?\}(.*)$").expect("valid code macro regex"));
static INLINE_CODE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{code(?::([^}]*))?\}(.*?)\{/code\}").expect("valid inline code regex")
});
static IMAGE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"#image\(([^)]*)\)").expect("valid image regex"));
static THUMBNAIL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"#thumbnail\([^)]*\)").expect("valid thumbnail regex"));
static HASH_MACRO_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:^|[^\w&])#([A-Za-z]\w*)\(").expect("valid hash macro regex")
});
static COLOR_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"&color\([^)]*\)(?:\s*\{[^}]*\})?").expect("valid color macro regex")
});
static BRACKET_MACRO_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{/?[A-Za-z][\w-]*(?::[^}]*)?\}").expect("valid bracket macro regex")
});
static LINK_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[\[([^\[\]]+?)\]\]").expect("valid link regex"));
static COLON_LINK_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(.+?):((?:https?|ftp)://\S+)$").expect("valid colon link regex")
});
static URL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(?:https?|ftp)://\S+$").expect("valid url regex"));
static LINE_BREAK_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"&br;").expect("valid line break regex"));
static ITALIC_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"'''(.+?)'''").expect("valid italic regex"));
static BOLD_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"''(.+?)''").expect("valid bold regex"));
static STRIKE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"%%(.+?)%%").expect("valid strike regex"));
static HEADER_ROW_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\|.*\|h\s*$").expect("valid header row regex"));
static SEPARATOR_ROW_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\|?\s*:?-{3,}:?\s*(?:\|\s*:?-{3,}:?\s*)*\|?\s*$").expect("valid separator regex")
});
static TASK_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*[-*+] \[[ xX]\] ").expect("valid task list regex"));
static MD_HEADING_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^#{1,6} \S").expect("valid markdown heading regex"));
static MD_BOLD_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\*\*[^*\s][^*]*\*\*").expect("valid markdown bold regex"));
static MD_LINK_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"!?\[[^\]]*\]\([^)\s]+\)").expect("valid markdown link regex"));
static MD_STRIKE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"~~[^~]+~~").expect("valid markdown strike regex"));

/// Which notation a document appears to be written in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectedMode {
    Legacy,
    Markdown,
    #[default]
    Ambiguous,
}

impl DetectedMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Legacy => "legacy",
            Self::Markdown => "markdown",
            Self::Ambiguous => "ambiguous",
        }
    }
}

impl fmt::Display for DetectedMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Independently excludable rewrite rules, in the order they are reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Rule {
    Heading,
    Quote,
    CodeBlock,
    CodeInline,
    ListOrdered,
    ListUnordered,
    ListSpacing,
    Table,
    Image,
    Link,
    LineBreak,
    Italic,
    Bold,
    Strike,
}

impl Rule {
    pub const ALL: [Rule; 14] = [
        Rule::Heading,
        Rule::Quote,
        Rule::CodeBlock,
        Rule::CodeInline,
        Rule::ListOrdered,
        Rule::ListUnordered,
        Rule::ListSpacing,
        Rule::Table,
        Rule::Image,
        Rule::Link,
        Rule::LineBreak,
        Rule::Italic,
        Rule::Bold,
        Rule::Strike,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Heading => "heading",
            Self::Quote => "quote",
            Self::CodeBlock => "code_block",
            Self::CodeInline => "code_inline",
            Self::ListOrdered => "list_ordered",
            Self::ListUnordered => "list_unordered",
            Self::ListSpacing => "list_spacing",
            Self::Table => "table",
            Self::Image => "image",
            Self::Link => "link",
            Self::LineBreak => "line_break",
            Self::Italic => "italic",
            Self::Bold => "bold",
            Self::Strike => "strike",
        }
    }
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Rule {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        let normalized = value.trim().to_ascii_lowercase().replace('-', "_");
        for rule in Rule::ALL {
            if rule.as_str() == normalized {
                return Ok(rule);
            }
        }
        let known = Rule::ALL.map(Rule::as_str).join(", ");
        bail!("unknown conversion rule `{}` (known rules: {known})", value.trim())
    }
}

pub fn parse_rules<S: AsRef<str>>(values: &[S]) -> Result<BTreeSet<Rule>> {
    let mut rules = BTreeSet::new();
    for value in values {
        if value.as_ref().trim().is_empty() {
            continue;
        }
        rules.insert(value.as_ref().parse::<Rule>()?);
    }
    Ok(rules)
}

/// Constructs left in place because they have no safe equivalent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WarningKind {
    ColorMacro,
    MergedCell,
    HeaderCell,
    UnknownBracketMacro,
    UnknownHashMacro,
    Thumbnail,
}

impl WarningKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ColorMacro => "color_macro",
            Self::MergedCell => "merged_cell",
            Self::HeaderCell => "header_cell",
            Self::UnknownBracketMacro => "unknown_bracket_macro",
            Self::UnknownHashMacro => "unknown_hash_macro",
            Self::Thumbnail => "thumbnail",
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ConvertOptions {
    pub force: bool,
    /// Key of the item being converted; `KEY/name` image arguments resolve against it.
    pub item_key: Option<String>,
    pub attachment_names: BTreeSet<String>,
    pub excluded_rules: BTreeSet<Rule>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConvertResult {
    pub output: String,
    pub mode: DetectedMode,
    /// Legacy signal weight minus markdown signal weight.
    pub score: i64,
    pub rules: BTreeSet<Rule>,
    pub warnings: BTreeMap<String, usize>,
    pub warning_lines: BTreeMap<String, Vec<usize>>,
    pub changed: bool,
}

impl ConvertResult {
    pub fn rule_names(&self) -> Vec<String> {
        self.rules.iter().map(|rule| rule.as_str().to_string()).collect()
    }
}

/// Classify `content` by weighing legacy-only signals against markdown-only signals.
pub fn detect(content: &str) -> (DetectedMode, i64) {
    let normalized = content.replace("\r\n", "\n");
    let mut legacy = 0i64;
    let mut markdown = 0i64;
    let mut in_fence = false;
    let mut in_code_macro = false;
    let mut table_rows = 0usize;
    let mut table_has_separator = false;

    for raw in normalized.split('\n') {
        let trimmed = raw.trim_start();
        if in_fence {
            if is_fence(trimmed) {
                in_fence = false;
            }
            continue;
        }
        if in_code_macro {
            if raw.contains("{/code}") {
                in_code_macro = false;
            }
            continue;
        }
        if is_fence(trimmed) {
            markdown += 3;
            in_fence = true;
            continue;
        }

        if trimmed.starts_with('|') {
            table_rows += 1;
            if SEPARATOR_ROW_RE.is_match(trimmed) {
                table_has_separator = true;
                markdown += 2;
            }
            if HEADER_ROW_RE.is_match(trimmed.trim_end()) {
                legacy += 2;
            }
        } else {
            if table_rows > 0 && !table_has_separator {
                legacy += 2;
            }
            table_rows = 0;
            table_has_separator = false;
        }

        if trimmed.starts_with('>') {
            continue;
        }
        let line = strip_code_spans(raw);

        if let Some(caps) = CODE_OPEN_RE.captures(line.trim_start()) {
            legacy += 3;
            if !caps.get(2).is_some_and(|rest| rest.as_str().contains("{/code}")) {
                in_code_macro = true;
            }
        } else if line.contains("{code") {
            legacy += 3;
        }
        legacy += 3 * line.matches("{quote}").count() as i64;
        if let Some(caps) = HEADING_RE.captures(&line) {
            legacy += caps[1].len().min(6) as i64;
        }
        if ORDERED_RE.is_match(&line) {
            legacy += 1;
        }
        if let Some(caps) = UNORDERED_RE.captures(&line)
            && caps[1].len() == 2
        {
            legacy += 1;
        }
        if BOLD_RE.is_match(&line) || STRIKE_RE.is_match(&line) {
            legacy += 1;
        }
        if line.contains("&color(")
            || line.contains("&br;")
            || line.contains("#image(")
            || line.contains("#thumbnail(")
        {
            legacy += 1;
        }
        if LINK_RE
            .captures(&line)
            .is_some_and(|caps| caps[1].contains('>') || COLON_LINK_RE.is_match(&caps[1]))
        {
            legacy += 1;
        }

        if TASK_RE.is_match(&line) {
            markdown += 2;
        }
        if MD_HEADING_RE.is_match(&line) {
            markdown += 1;
        }
        if MD_BOLD_RE.is_match(&line) {
            markdown += 1;
        }
        if MD_LINK_RE.is_match(&line) {
            markdown += 1;
        }
        if MD_STRIKE_RE.is_match(&line) {
            markdown += 1;
        }
    }
    if table_rows > 0 && !table_has_separator {
        legacy += 2;
    }

    let score = legacy - markdown;
    let mode = match score {
        s if s > 0 => DetectedMode::Legacy,
        s if s < 0 => DetectedMode::Markdown,
        _ => DetectedMode::Ambiguous,
    };
    (mode, score)
}

/// Rewrite legacy wiki notation into GitHub-flavoured markdown.
///
/// Content that already reads as markdown, or that cannot be classified, is returned
/// unchanged unless `options.force` is set. The converter never fails: constructs it
/// does not understand are left in place and reported through `warnings`.
pub fn convert(content: &str, options: &ConvertOptions) -> ConvertResult {
    let (mode, score) = detect(content);
    if mode != DetectedMode::Legacy && !options.force {
        return ConvertResult {
            output: content.to_string(),
            mode,
            score,
            rules: BTreeSet::new(),
            warnings: BTreeMap::new(),
            warning_lines: BTreeMap::new(),
            changed: false,
        };
    }

    let crlf = content.contains("\r\n");
    let normalized = content.replace("\r\n", "\n");
    let lines: Vec<&str> = normalized.split('\n').collect();

    let mut converter = Converter::new(options);
    converter.run(&lines);

    let mut output = converter.output.join("\n");
    if crlf {
        output = output.replace('\n', "\r\n");
    }
    let changed = output != content;
    ConvertResult {
        output,
        mode,
        score,
        rules: converter.fired,
        warnings: converter.warnings,
        warning_lines: converter.warning_lines,
        changed,
    }
}

#[derive(Debug, Clone, Copy)]
struct ListLevel {
    ordered: bool,
    counter: usize,
    width: usize,
}

struct Converter<'a> {
    options: &'a ConvertOptions,
    output: Vec<String>,
    fired: BTreeSet<Rule>,
    warnings: BTreeMap<String, usize>,
    warning_lines: BTreeMap<String, Vec<usize>>,
    list_stack: Vec<ListLevel>,
    list_converted: bool,
}

impl<'a> Converter<'a> {
    fn new(options: &'a ConvertOptions) -> Self {
        Self {
            options,
            output: Vec::new(),
            fired: BTreeSet::new(),
            warnings: BTreeMap::new(),
            warning_lines: BTreeMap::new(),
            list_stack: Vec::new(),
            list_converted: false,
        }
    }

    fn enabled(&self, rule: Rule) -> bool {
        !self.options.excluded_rules.contains(&rule)
    }

    fn fire(&mut self, rule: Rule) {
        self.fired.insert(rule);
    }

    fn warn(&mut self, kind: WarningKind, line_no: usize) {
        let lines = self
            .warning_lines
            .entry(kind.as_str().to_string())
            .or_default();
        if lines.last() == Some(&line_no) {
            return;
        }
        lines.push(line_no);
        *self.warnings.entry(kind.as_str().to_string()).or_insert(0) += 1;
    }

    fn run(&mut self, lines: &[&str]) {
        let mut index = 0;
        while index < lines.len() {
            let line = lines[index];
            let trimmed = line.trim_start();

            if trimmed.is_empty() {
                self.list_stack.clear();
                self.list_converted = false;
                self.output.push(line.to_string());
                index += 1;
                continue;
            }

            if is_fence(trimmed) {
                self.leave_list(line);
                let end = closing_fence(lines, index);
                self.output
                    .extend(lines[index..=end].iter().map(|line| line.to_string()));
                index = end + 1;
                continue;
            }

            if trimmed.starts_with('>') {
                self.leave_list(line);
                self.output.push(line.to_string());
                index += 1;
                continue;
            }

            if trimmed.starts_with("{quote}") {
                match find_closing(lines, index, "{/quote}") {
                    Some(end) => {
                        self.leave_list(line);
                        if self.enabled(Rule::Quote) {
                            self.emit_quote(lines, index, end);
                        } else {
                            self.output
                                .extend(lines[index..=end].iter().map(|line| line.to_string()));
                        }
                        index = end + 1;
                        continue;
                    }
                    None => self.warn(WarningKind::UnknownBracketMacro, index + 1),
                }
            }

            if let Some(caps) = CODE_OPEN_RE.captures(trimmed)
                && !caps
                    .get(2)
                    .is_some_and(|rest| rest.as_str().contains("{/code}"))
            {
                match find_closing(lines, index + 1, "{/code}") {
                    Some(end) => {
                        self.leave_list(line);
                        if self.enabled(Rule::CodeBlock) {
                            let language = caps.get(1).map(|m| m.as_str().trim()).unwrap_or("");
                            let rest = caps.get(2).map(|m| m.as_str()).unwrap_or("");
                            self.emit_code_block(lines, index, end, language, rest);
                        } else {
                            self.output
                                .extend(lines[index..=end].iter().map(|line| line.to_string()));
                        }
                        index = end + 1;
                        continue;
                    }
                    None => self.warn(WarningKind::UnknownBracketMacro, index + 1),
                }
            }

            if trimmed.starts_with('|') {
                let mut end = index;
                while end + 1 < lines.len() && lines[end + 1].trim_start().starts_with('|') {
                    end += 1;
                }
                self.leave_list(line);
                self.emit_table(lines, index, end);
                index = end + 1;
                continue;
            }

            self.emit_line(line, index + 1);
            index += 1;
        }
    }

    /// Close an open list block before non-list content, separating the two with a blank line.
    fn leave_list(&mut self, next: &str) {
        if self.list_stack.is_empty() {
            return;
        }
        let converted = self.list_converted;
        self.list_stack.clear();
        self.list_converted = false;
        if converted && !next.trim().is_empty() && self.enabled(Rule::ListSpacing) {
            self.output.push(String::new());
            self.fire(Rule::ListSpacing);
        }
    }

    fn emit_line(&mut self, line: &str, line_no: usize) {
        if self.enabled(Rule::Heading)
            && let Some(caps) = HEADING_RE.captures(line)
        {
            self.leave_list(line);
            let depth = caps[1].len();
            let text = self.inline(&caps[2], line_no);
            self.output.push(format!("{} {text}", "#".repeat(depth)));
            self.fire(Rule::Heading);
            return;
        }

        if self.enabled(Rule::ListOrdered)
            && let Some(caps) = ORDERED_RE.captures(line)
        {
            self.emit_list_item(true, caps[1].len(), &caps[2], line, line_no);
            return;
        }

        if self.enabled(Rule::ListUnordered)
            && let Some(caps) = UNORDERED_RE.captures(line)
        {
            let depth = caps[1].len();
            // Deep dash runs only continue an existing nested list; otherwise they are prose.
            if depth < 3 || self.list_stack.len() + 1 >= depth {
                self.emit_list_item(false, depth, &caps[2], line, line_no);
                return;
            }
        }

        self.leave_list(line);
        let converted = self.inline(line, line_no);
        self.output.push(converted);
    }

    fn emit_list_item(
        &mut self,
        ordered: bool,
        depth: usize,
        text: &str,
        original: &str,
        line_no: usize,
    ) {
        self.list_stack.truncate(depth);
        while self.list_stack.len() < depth {
            self.list_stack.push(ListLevel {
                ordered,
                counter: 0,
                width: 2,
            });
        }
        let Some(level) = self.list_stack.last_mut() else {
            return;
        };
        if level.ordered != ordered {
            level.ordered = ordered;
            level.counter = 0;
        }
        level.counter += 1;
        let marker = if ordered {
            format!("{}. ", level.counter)
        } else {
            "- ".to_string()
        };
        level.width = marker.len();

        let indent: usize = self.list_stack[..depth - 1]
            .iter()
            .map(|level| level.width)
            .sum();
        let text = self.inline(text, line_no);
        let rendered = format!("{}{marker}{text}", " ".repeat(indent));
        if rendered != original {
            self.list_converted = true;
            self.fire(if ordered {
                Rule::ListOrdered
            } else {
                Rule::ListUnordered
            });
        }
        self.output.push(rendered);
    }

    /// Text after `{/quote}` on the closing line cannot stay inside the blockquote, so it
    /// is emitted as its own line below it.
    fn emit_quote(&mut self, lines: &[&str], start: usize, end: usize) {
        let mut body: Vec<&str> = Vec::new();
        let mut trailing = "";
        for (offset, line) in lines[start..=end].iter().enumerate() {
            let mut text: &str = line;
            if offset == 0 {
                let opened = text.trim_start();
                text = opened.strip_prefix("{quote}").unwrap_or(opened);
            }
            if start + offset == end
                && let Some(position) = text.find("{/quote}")
            {
                trailing = &text[position + "{/quote}".len()..];
                text = &text[..position];
            }
            body.push(text);
        }
        if body.first().is_some_and(|first| first.trim().is_empty()) {
            body.remove(0);
        }
        if body.last().is_some_and(|last| last.trim().is_empty()) {
            body.pop();
        }

        for text in body {
            if text.is_empty() {
                self.output.push(">".to_string());
            } else {
                self.output.push(format!("> {text}"));
            }
        }
        self.fire(Rule::Quote);
        if !trailing.trim().is_empty() {
            let text = self.inline(trailing.trim_start(), end + 1);
            self.output.push(text);
        }
    }

    /// Like quotes, text trailing `{/code}` moves to a line after the closing fence.
    fn emit_code_block(
        &mut self,
        lines: &[&str],
        start: usize,
        end: usize,
        language: &str,
        rest: &str,
    ) {
        let indent_len = lines[start].len() - lines[start].trim_start().len();
        let indent = &lines[start][..indent_len];
        self.output.push(format!("{indent}```{language}"));
        if !rest.trim().is_empty() {
            self.output.push(rest.to_string());
        }
        for line in &lines[start + 1..end] {
            self.output.push(line.to_string());
        }

        let closing = lines[end];
        let (before, after) = match closing.find("{/code}") {
            Some(position) => (&closing[..position], &closing[position + "{/code}".len()..]),
            None => (closing, ""),
        };
        if !before.trim().is_empty() {
            self.output.push(before.to_string());
        }
        self.output.push(format!("{indent}```"));
        self.fire(Rule::CodeBlock);
        if !after.trim().is_empty() {
            let text = self.inline(after.trim_start(), end + 1);
            self.output.push(text);
        }
    }

    fn emit_table(&mut self, lines: &[&str], start: usize, end: usize) {
        let block = &lines[start..=end];
        let has_separator = block
            .iter()
            .any(|line| SEPARATOR_ROW_RE.is_match(line.trim()));
        if has_separator || !self.enabled(Rule::Table) {
            for (offset, line) in block.iter().enumerate() {
                let text = self.inline(line, start + offset + 1);
                self.output.push(text);
            }
            return;
        }

        for (offset, line) in block.iter().enumerate() {
            let line_no = start + offset + 1;
            let mut body = line.trim();
            if let Some(stripped) = body.strip_suffix('h')
                && stripped.ends_with('|')
            {
                body = stripped;
                if offset > 0 {
                    self.warn(WarningKind::HeaderCell, line_no);
                }
            }
            let inner = body.strip_prefix('|').unwrap_or(body);
            let inner = inner.strip_suffix('|').unwrap_or(inner);

            let raw_cells: Vec<&str> = inner.split('|').map(str::trim).collect();
            let mut cells = Vec::with_capacity(raw_cells.len());
            for cell in &raw_cells {
                if cell.is_empty() && raw_cells.len() > 1 {
                    self.warn(WarningKind::MergedCell, line_no);
                }
                if cell.starts_with('~') {
                    self.warn(WarningKind::HeaderCell, line_no);
                }
                cells.push(self.inline(cell, line_no));
            }

            self.output.push(format!("| {} |", cells.join(" | ")));
            if offset == 0 {
                let separator = vec!["---"; cells.len()].join(" | ");
                self.output.push(format!("| {separator} |"));
            }
        }
        self.fire(Rule::Table);
    }

    /// Convert span-level markup, leaving backtick code spans byte-for-byte intact.
    fn inline(&mut self, text: &str, line_no: usize) -> String {
        let mut output = String::with_capacity(text.len());
        for (is_code, piece) in split_code_spans(text) {
            if is_code {
                output.push_str(piece);
            } else {
                let converted = self.inline_text(piece, line_no);
                output.push_str(&converted);
            }
        }
        output
    }

    fn inline_text(&mut self, text: &str, line_no: usize) -> String {
        let mut output = String::with_capacity(text.len());
        let mut last = 0;
        for caps in INLINE_CODE_RE.captures_iter(text) {
            let Some(whole) = caps.get(0) else {
                continue;
            };
            let before = self.markup(&text[last..whole.start()], line_no);
            output.push_str(&before);
            if self.enabled(Rule::CodeInline) {
                let language = caps.get(1).map(|m| m.as_str().trim()).unwrap_or("");
                let code = caps.get(2).map(|m| m.as_str()).unwrap_or("");
                output.push_str(&render_inline_code(language, code));
                self.fire(Rule::CodeInline);
            } else {
                output.push_str(whole.as_str());
            }
            last = whole.end();
        }
        let rest = self.markup(&text[last..], line_no);
        output.push_str(&rest);
        output
    }

    fn markup(&mut self, text: &str, line_no: usize) -> String {
        if text.is_empty() {
            return String::new();
        }
        self.scan_warnings(text, line_no);

        let mut current = if self.enabled(Rule::Image) {
            self.rewrite_images(text, line_no)
        } else {
            text.to_string()
        };
        current = self.rewrite(Rule::Link, current, &LINK_RE, rewrite_link);
        current = self.rewrite(Rule::LineBreak, current, &LINE_BREAK_RE, |_| "<br>".to_string());
        current = self.rewrite(Rule::Italic, current, &ITALIC_RE, |caps| {
            format!("*{}*", &caps[1])
        });
        current = self.rewrite(Rule::Bold, current, &BOLD_RE, |caps| {
            format!("**{}**", &caps[1])
        });
        current = self.rewrite(Rule::Strike, current, &STRIKE_RE, |caps| {
            format!("~~{}~~", &caps[1])
        });
        current
    }

    fn rewrite<F>(&mut self, rule: Rule, text: String, pattern: &Regex, replace: F) -> String
    where
        F: Fn(&Captures) -> String,
    {
        if !self.enabled(rule) {
            return text;
        }
        let replaced = pattern
            .replace_all(&text, |caps: &Captures| replace(caps))
            .into_owned();
        if replaced != text {
            self.fire(rule);
        }
        replaced
    }

    fn rewrite_images(&mut self, text: &str, line_no: usize) -> String {
        let mut output = String::with_capacity(text.len());
        let mut last = 0;
        for caps in IMAGE_RE.captures_iter(text) {
            let Some(whole) = caps.get(0) else {
                continue;
            };
            output.push_str(&text[last..whole.start()]);
            let target = caps.get(1).map(|m| m.as_str().trim()).unwrap_or("");
            match self.resolve_image(target) {
                Some(image) => {
                    output.push_str(&image);
                    self.fire(Rule::Image);
                }
                None => {
                    output.push_str(whole.as_str());
                    self.warn(WarningKind::UnknownHashMacro, line_no);
                }
            }
            last = whole.end();
        }
        output.push_str(&text[last..]);
        output
    }

    fn resolve_image(&self, target: &str) -> Option<String> {
        if target.is_empty() {
            return None;
        }
        let mut name = target;
        if let Some(key) = self.options.item_key.as_deref()
            && let Some(stripped) = target.strip_prefix(key)
            && let Some(stripped) = stripped.strip_prefix('/')
        {
            name = stripped;
        }
        if self.options.attachment_names.contains(name) {
            return Some(format!("![{name}][{name}]"));
        }
        if URL_RE.is_match(target) {
            return Some(format!("![image]({target})"));
        }
        None
    }

    fn scan_warnings(&mut self, text: &str, line_no: usize) {
        if COLOR_RE.is_match(text) {
            self.warn(WarningKind::ColorMacro, line_no);
        }
        if THUMBNAIL_RE.is_match(text) {
            self.warn(WarningKind::Thumbnail, line_no);
        }
        let without_color = COLOR_RE.replace_all(text, "");
        if BRACKET_MACRO_RE.is_match(&without_color) {
            self.warn(WarningKind::UnknownBracketMacro, line_no);
        }
        let unknown_hash = HASH_MACRO_RE
            .captures_iter(text)
            .any(|caps| !matches!(&caps[1], "image" | "thumbnail"));
        if unknown_hash {
            self.warn(WarningKind::UnknownHashMacro, line_no);
        }
    }
}

fn rewrite_link(caps: &Captures) -> String {
    let inner = caps[1].trim();
    if let Some((label, url)) = inner.split_once('>')
        && !label.trim().is_empty()
        && !url.trim().is_empty()
    {
        return format!("[{}]({})", label.trim(), url.trim());
    }
    if let Some(colon) = COLON_LINK_RE.captures(inner) {
        return format!("[{}]({})", colon[1].trim(), &colon[2]);
    }
    if URL_RE.is_match(inner) {
        return format!("<{inner}>");
    }
    caps[0].to_string()
}

fn render_inline_code(language: &str, code: &str) -> String {
    let span = if code.contains('`') {
        format!("`` {code} ``")
    } else {
        format!("`{code}`")
    };
    if language.is_empty() {
        span
    } else {
        format!("{language}: {span}")
    }
}

fn is_fence(trimmed: &str) -> bool {
    trimmed.starts_with("```") || trimmed.starts_with("~~~")
}

/// Index of the fence closing the one opened at `start`, or the last line when unclosed.
fn closing_fence(lines: &[&str], start: usize) -> usize {
    let marker = &lines[start].trim_start()[..3];
    for (index, line) in lines.iter().enumerate().skip(start + 1) {
        if line.trim_start().starts_with(marker) {
            return index;
        }
    }
    lines.len() - 1
}

fn find_closing(lines: &[&str], from: usize, marker: &str) -> Option<usize> {
    lines
        .iter()
        .enumerate()
        .skip(from)
        .find(|(_, line)| line.contains(marker))
        .map(|(index, _)| index)
}

/// Split a line into `(is_code, text)` pieces on matched backtick runs.
fn split_code_spans(text: &str) -> Vec<(bool, &str)> {
    let bytes = text.as_bytes();
    let mut pieces = Vec::new();
    let mut start = 0;
    let mut cursor = 0;
    while cursor < bytes.len() {
        if bytes[cursor] != b'`' {
            cursor += 1;
            continue;
        }
        let mut run_end = cursor;
        while run_end < bytes.len() && bytes[run_end] == b'`' {
            run_end += 1;
        }
        let run = &text[cursor..run_end];
        match text[run_end..].find(run) {
            Some(found) => {
                let close_end = run_end + found + run.len();
                if start < cursor {
                    pieces.push((false, &text[start..cursor]));
                }
                pieces.push((true, &text[cursor..close_end]));
                start = close_end;
                cursor = close_end;
            }
            None => cursor = run_end,
        }
    }
    if start < text.len() {
        pieces.push((false, &text[start..]));
    }
    pieces
}

fn strip_code_spans(text: &str) -> String {
    split_code_spans(text)
        .into_iter()
        .filter(|(is_code, _)| !is_code)
        .map(|(_, piece)| piece)
        .collect()
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use super::{ConvertOptions, DetectedMode, Rule, convert, detect, parse_rules};

    fn convert_default(input: &str) -> super::ConvertResult {
        convert(input, &ConvertOptions::default())
    }

    fn forced() -> ConvertOptions {
        ConvertOptions {
            force: true,
            ..ConvertOptions::default()
        }
    }

    #[test]
    fn converts_mixed_legacy_document() {
        let input = "* Title\n{quote}Quoted\nLine{/quote}\n{code:go}\nfmt.Println(\"x\")\n{/code}\n''bold''";
        let result = convert_default(input);
        assert_eq!(result.mode, DetectedMode::Legacy);
        assert!(result.score > 0);
        assert!(result.changed);
        assert!(result.output.contains("# Title"));
        assert!(result.output.contains("> Quoted"));
        assert!(result.output.contains("> Line"));
        assert!(result.output.contains("```go\nfmt.Println(\"x\")\n```"));
        assert!(result.output.contains("**bold**"));
        assert_eq!(
            result.rule_names(),
            vec!["heading", "quote", "code_block", "bold"]
        );
    }

    #[test]
    fn markdown_input_passes_through() {
        let input = "```\ncode\n```\n- [x] done";
        let result = convert_default(input);
        assert_eq!(result.mode, DetectedMode::Markdown);
        assert_eq!(result.output, input);
        assert!(!result.changed);
        assert!(result.rules.is_empty());
    }

    #[test]
    fn converted_output_is_left_alone_on_second_pass() {
        let first = convert_default(
            "* Title\n{quote}Quoted\nLine{/quote}\n{code:go}\nfmt.Println(\"x\")\n{/code}\n''bold''",
        );
        let second = convert_default(&first.output);
        assert_ne!(second.mode, DetectedMode::Legacy);
        assert_eq!(second.output, first.output);
        assert!(!second.changed);

        let table = convert_default("| H1 | H2 |\n|a|b|");
        let again = convert_default(&table.output);
        assert_eq!(again.output, table.output);
    }

    #[test]
    fn synthesizes_table_separator_and_repads_cells() {
        let result = convert_default("| H1 | H2 |\n|a|b|");
        assert_eq!(result.mode, DetectedMode::Legacy);
        assert_eq!(result.output, "| H1 | H2 |\n| --- | --- |\n| a | b |");
        assert!(result.rules.contains(&Rule::Table));
    }

    #[test]
    fn table_with_separator_is_untouched() {
        let input = "| a | b |\n|---|---|\n|c|d|";
        let result = convert(input, &forced());
        assert_eq!(result.output, input);
        assert!(!result.rules.contains(&Rule::Table));
    }

    #[test]
    fn table_markers_produce_warnings() {
        let result = convert_default("|A|B|h\n|c|d|h\n|~e||");
        assert_eq!(
            result.output,
            "| A | B |\n| --- | --- |\n| c | d |\n| ~e |  |"
        );
        assert_eq!(result.warnings.get("header_cell"), Some(&2));
        assert_eq!(result.warning_lines.get("header_cell"), Some(&vec![2, 3]));
        assert_eq!(result.warning_lines.get("merged_cell"), Some(&vec![3]));
    }

    #[test]
    fn inline_code_spans_are_immune() {
        let input = "* Title with `''raw''` and ``{code}x{/code}``\n''bold''";
        let result = convert_default(input);
        assert_eq!(
            result.output,
            "# Title with `''raw''` and ``{code}x{/code}``\n**bold**"
        );
    }

    #[test]
    fn fenced_code_is_immune_even_when_forced() {
        let input = "```\n* not a heading\n''x''\n```\n";
        let result = convert(input, &forced());
        assert_eq!(result.output, input);
        assert!(result.rules.is_empty());
    }

    #[test]
    fn quote_lines_are_never_rewritten() {
        let result = convert_default("> ''keep''\n''bold''");
        assert_eq!(result.output, "> ''keep''\n**bold**");

        let nested = convert_default("{quote}\n''x''\n{code}\ny\n{/code}\n\n{/quote}");
        assert_eq!(nested.output, "> ''x''\n> {code}\n> y\n> {/code}\n>");
    }

    #[test]
    fn text_after_closing_macros_moves_below_the_block() {
        let quote = convert("* Title\n{quote}a{/quote} after", &forced());
        assert_eq!(quote.output, "# Title\n> a\nafter");

        let code = convert("* Title\n{code}\nx\n{/code} after", &forced());
        assert_eq!(code.output, "# Title\n```\nx\n```\nafter");
    }

    #[test]
    fn deep_heading_runs_keep_their_length() {
        let result = convert_default("******* deep\n* top");
        assert_eq!(result.output, "####### deep\n# top");
    }

    #[test]
    fn ordered_lists_number_and_nest() {
        let result = convert_default("+ one\n+ two\n++ nested\n+ three\nafter");
        assert_eq!(result.output, "1. one\n2. two\n   1. nested\n3. three\n\nafter");
        assert!(result.rules.contains(&Rule::ListOrdered));
        assert!(result.rules.contains(&Rule::ListSpacing));
    }

    #[test]
    fn dash_lists_follow_depth_and_keep_prose_dashes() {
        let result = convert_default("- a\n-- b\n--- c\n\n--- not a list\n---");
        assert_eq!(result.output, "- a\n  - b\n    - c\n\n--- not a list\n---");
        assert!(result.rules.contains(&Rule::ListUnordered));
    }

    #[test]
    fn single_line_code_macro_becomes_inline_code() {
        let result = convert_default("see {code:rust}let x = 1;{/code} and {code}y{/code}\n* H");
        assert_eq!(result.output, "see rust: `let x = 1;` and `y`\n# H");
        assert!(result.rules.contains(&Rule::CodeInline));
    }

    #[test]
    fn images_resolve_attachments_and_urls() {
        let options = ConvertOptions {
            item_key: Some("PROJ-1".to_string()),
            attachment_names: BTreeSet::from(["diagram.png".to_string()]),
            ..ConvertOptions::default()
        };
        let input = "#image(diagram.png)\n#image(PROJ-1/diagram.png)\n#image(https://x.test/y.png)\n#image(missing.png)";
        let result = convert(input, &options);
        assert_eq!(
            result.output,
            "![diagram.png][diagram.png]\n![diagram.png][diagram.png]\n![image](https://x.test/y.png)\n#image(missing.png)"
        );
        assert_eq!(result.warning_lines.get("unknown_hash_macro"), Some(&vec![4]));
    }

    #[test]
    fn links_and_line_breaks() {
        let input = "[[Docs>https://e.test]] [[Home:https://h.test]] [[https://raw.test]]&br;x\n[[Wiki Page]]";
        let result = convert_default(input);
        assert_eq!(
            result.output,
            "[Docs](https://e.test) [Home](https://h.test) <https://raw.test><br>x\n[[Wiki Page]]"
        );
        assert!(result.rules.contains(&Rule::Link));
        assert!(result.rules.contains(&Rule::LineBreak));
    }

    #[test]
    fn unsupported_macros_warn_once_per_line() {
        let input = "&color(red){x} &color(blue){y}\n#thumbnail(a.png)\n{toc}\n#video(x)";
        let result = convert(input, &forced());
        assert_eq!(result.output, input);
        assert_eq!(result.warnings.get("color_macro"), Some(&1));
        assert_eq!(result.warning_lines.get("color_macro"), Some(&vec![1]));
        assert_eq!(result.warning_lines.get("thumbnail"), Some(&vec![2]));
        assert_eq!(
            result.warning_lines.get("unknown_bracket_macro"),
            Some(&vec![3])
        );
        assert_eq!(result.warning_lines.get("unknown_hash_macro"), Some(&vec![4]));
    }

    #[test]
    fn excluded_rules_are_left_verbatim() {
        let options = ConvertOptions {
            excluded_rules: BTreeSet::from([Rule::Bold]),
            ..ConvertOptions::default()
        };
        let result = convert("''x'' and '''y'''\n* T", &options);
        assert_eq!(result.output, "''x'' and *y*\n# T");
        assert!(!result.rules.contains(&Rule::Bold));
        assert!(result.rules.contains(&Rule::Italic));
    }

    #[test]
    fn ties_need_force() {
        let input = "# Title\n''x''";
        let (mode, score) = detect(input);
        assert_eq!(mode, DetectedMode::Ambiguous);
        assert_eq!(score, 0);
        assert_eq!(convert_default(input).output, input);
        assert_eq!(convert(input, &forced()).output, "# Title\n**x**");
    }

    #[test]
    fn line_endings_are_preserved() {
        let result = convert_default("* A\r\n''b''\r\n");
        assert_eq!(result.output, "# A\r\n**b**\r\n");
    }

    #[test]
    fn strike_and_unclosed_code_macro() {
        let result = convert_default("%%gone%%\n{code}\nnever closed");
        assert_eq!(result.output, "~~gone~~\n{code}\nnever closed");
        assert_eq!(
            result.warning_lines.get("unknown_bracket_macro"),
            Some(&vec![2])
        );
    }

    #[test]
    fn parse_rules_rejects_unknown_names() {
        let rules = parse_rules(&["image", "list-spacing"]).expect("parse");
        assert_eq!(rules, BTreeSet::from([Rule::Image, Rule::ListSpacing]));
        assert!(parse_rules(&["emoji"]).is_err());
    }
}
