//! Worksheet text-form library.
//! A worksheet is an ordered list of items (markup, bundle references, directives, title,
//! description). This crate renders that list to a flat, editable text form and classifies
//! edited text back into items, keeping the core pure and the edit round trip injectable.

pub mod core {
    use crate::directive::{self, DirectivePolicy};
    use indexmap::IndexMap;
    use serde::{Deserialize, Serialize};
    use std::{collections::HashSet, fmt};
    use uuid::Uuid;

    /* ------------------------------- IDs ------------------------------- */

    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct WorksheetId(pub Uuid);

    impl WorksheetId {
        pub fn new() -> Self {
            Self(Uuid::new_v4())
        }
    }

    impl fmt::Display for WorksheetId {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            self.0.fmt(f)
        }
    }

    /* ------------------------------ Item kinds ------------------------------ */

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    #[serde(rename_all = "lowercase")]
    pub enum ItemKind {
        Markup,
        Bundle,
        Directive,
        Title,
        Description,
    }

    impl ItemKind {
        pub fn as_str(self) -> &'static str {
            match self {
                ItemKind::Markup => "markup",
                ItemKind::Bundle => "bundle",
                ItemKind::Directive => "directive",
                ItemKind::Title => "title",
                ItemKind::Description => "description",
            }
        }
    }

    impl fmt::Display for ItemKind {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str(self.as_str())
        }
    }

    /// Sub-kind of a recognised directive.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(rename_all = "lowercase")]
    pub enum DirectiveKind {
        Display,
        Image,
        Metadata,
    }

    impl DirectiveKind {
        /// Binding kind named after the colon of a field directive (`image` or `metadata`).
        pub fn from_binding(s: &str) -> Option<Self> {
            match s {
                "image" => Some(DirectiveKind::Image),
                "metadata" => Some(DirectiveKind::Metadata),
                _ => None,
            }
        }

        pub fn as_str(self) -> &'static str {
            match self {
                DirectiveKind::Display => "display",
                DirectiveKind::Image => "image",
                DirectiveKind::Metadata => "metadata",
            }
        }
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(rename_all = "lowercase")]
    pub enum DisplayMode {
        Table,
        Default,
        Inline,
    }

    impl DisplayMode {
        pub fn from_name(s: &str) -> Option<Self> {
            match s {
                "table" => Some(DisplayMode::Table),
                "default" => Some(DisplayMode::Default),
                "inline" => Some(DisplayMode::Inline),
                _ => None,
            }
        }

        pub fn as_str(self) -> &'static str {
            match self {
                DisplayMode::Table => "table",
                DisplayMode::Default => "default",
                DisplayMode::Inline => "inline",
            }
        }
    }

    /* ------------------------------ Directives ------------------------------ */

    /// Structured form of a directive.
    ///
    /// At most one of the display sub-record (`display`) and the field binding
    /// (`name`/`path`) is set. An unrecognised directive keeps only its `markup`.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct DirectiveRecord {
        pub directive: Option<DirectiveKind>,
        pub name: Option<String>,
        pub path: Option<String>,
        /// Exact directive text as captured; rendering emits it verbatim.
        pub markup: String,
        pub display: Option<DisplayMode>,
    }

    impl DirectiveRecord {
        pub fn is_recognized(&self) -> bool {
            self.directive.is_some()
        }
    }

    /* -------------------------------- Items -------------------------------- */

    /// One worksheet item. Built fresh on every parse and not mutated afterwards.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(tag = "type", rename_all = "lowercase")]
    pub enum WorksheetItem {
        Markup {
            value: String,
        },
        Bundle {
            bundle_uuid: String,
            /// Bracketed annotation, `None` when the line had no brackets.
            value: Option<String>,
        },
        Directive {
            value: DirectiveRecord,
        },
        Title {
            value: String,
        },
        Description {
            value: String,
        },
    }

    /// Borrowed view of an item's payload.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
    #[serde(untagged)]
    pub enum ItemValue<'a> {
        Absent,
        Text(&'a str),
        Directive(&'a DirectiveRecord),
    }

    impl WorksheetItem {
        pub fn markup(value: impl Into<String>) -> Self {
            WorksheetItem::Markup {
                value: value.into(),
            }
        }

        pub fn bundle(bundle_uuid: impl Into<String>, value: Option<String>) -> Self {
            WorksheetItem::Bundle {
                bundle_uuid: bundle_uuid.into(),
                value,
            }
        }

        pub fn kind(&self) -> ItemKind {
            match self {
                WorksheetItem::Markup { .. } => ItemKind::Markup,
                WorksheetItem::Bundle { .. } => ItemKind::Bundle,
                WorksheetItem::Directive { .. } => ItemKind::Directive,
                WorksheetItem::Title { .. } => ItemKind::Title,
                WorksheetItem::Description { .. } => ItemKind::Description,
            }
        }

        pub fn bundle_uuid(&self) -> Option<&str> {
            match self {
                WorksheetItem::Bundle { bundle_uuid, .. } => Some(bundle_uuid),
                _ => None,
            }
        }

        pub fn value(&self) -> ItemValue<'_> {
            match self {
                WorksheetItem::Markup { value }
                | WorksheetItem::Title { value }
                | WorksheetItem::Description { value } => ItemValue::Text(value),
                WorksheetItem::Bundle { value, .. } => match value {
                    Some(v) => ItemValue::Text(v),
                    None => ItemValue::Absent,
                },
                WorksheetItem::Directive { value } => ItemValue::Directive(value),
            }
        }

        /// Rebuild an item from its stored row; directive text goes through the expander.
        pub fn from_row(row: ItemRow, policy: DirectivePolicy) -> Result<Self, WorksheetError> {
            let ItemRow {
                bundle_uuid,
                value,
                kind,
            } = row;
            let text = value.clone().unwrap_or_default();
            let item = match kind {
                ItemKind::Markup => WorksheetItem::Markup { value: text },
                ItemKind::Title => WorksheetItem::Title { value: text },
                ItemKind::Description => WorksheetItem::Description { value: text },
                ItemKind::Directive => WorksheetItem::Directive {
                    value: directive::expand_with(&text, policy)?,
                },
                ItemKind::Bundle => WorksheetItem::Bundle {
                    bundle_uuid: bundle_uuid.ok_or(WorksheetError::MissingBundleUuid)?,
                    value,
                },
            };
            Ok(item)
        }

        pub fn to_row(&self) -> ItemRow {
            let value = match self.value() {
                ItemValue::Absent => None,
                ItemValue::Text(t) => Some(t.to_string()),
                ItemValue::Directive(d) => Some(d.markup.clone()),
            };
            ItemRow {
                bundle_uuid: self.bundle_uuid().map(str::to_string),
                value,
                kind: self.kind(),
            }
        }
    }

    /// Flat storage shape of an item: `(bundle_uuid, value, type)`.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct ItemRow {
        #[serde(default)]
        pub bundle_uuid: Option<String>,
        #[serde(default)]
        pub value: Option<String>,
        #[serde(rename = "type")]
        pub kind: ItemKind,
    }

    /* ------------------------------- Bundles ------------------------------- */

    /// Bundle metadata supplied by the bundle store.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct BundleInfo {
        pub uuid: String,
        pub bundle_type: Option<String>,
        #[serde(default)]
        pub metadata: IndexMap<String, String>,
    }

    impl BundleInfo {
        pub fn new(uuid: impl Into<String>, bundle_type: Option<String>) -> Self {
            Self {
                uuid: uuid.into(),
                bundle_type,
                metadata: IndexMap::new(),
            }
        }

        /// False when the type descriptor is missing; such references render as broken.
        pub fn is_complete(&self) -> bool {
            self.bundle_type.is_some()
        }
    }

    /* ------------------------------ Worksheet ------------------------------ */

    /// Worksheet state handed to the renderer and the form session.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct WorksheetInfo {
        pub uuid: WorksheetId,
        pub name: String,
        #[serde(default)]
        pub items: Vec<WorksheetItem>,
        /// Bundle info keyed by bundle uuid.
        #[serde(default)]
        pub bundles: IndexMap<String, BundleInfo>,
    }

    impl WorksheetInfo {
        pub fn new(name: impl Into<String>) -> Self {
            Self {
                uuid: WorksheetId::new(),
                name: name.into(),
                items: vec![],
                bundles: IndexMap::new(),
            }
        }

        pub fn bundle(&self, uuid: &str) -> Option<&BundleInfo> {
            self.bundles.get(uuid)
        }

        /// Items as `(bundle_uuid, value, kind)` tuples.
        pub fn current_items(&self) -> Vec<(Option<&str>, ItemValue<'_>, ItemKind)> {
            self.items
                .iter()
                .map(|item| (item.bundle_uuid(), item.value(), item.kind()))
                .collect()
        }

        /// Replace the item list. Bundle info is kept only for uuids still referenced.
        pub fn update_items(&mut self, items: Vec<WorksheetItem>) {
            self.items = items;
            let referenced: HashSet<&str> =
                self.items.iter().filter_map(|i| i.bundle_uuid()).collect();
            self.bundles
                .retain(|uuid, _| referenced.contains(uuid.as_str()));
        }
    }

    /* ---------------------------- Errors (domain) ---------------------------- */

    #[derive(Debug, thiserror::Error)]
    pub enum WorksheetError {
        #[error("No change made; aborting")]
        NoChange,
        #[error("unrecognized directive {0:?}")]
        UnrecognizedDirective(String),
        #[error("bundle item is missing its bundle uuid")]
        MissingBundleUuid,
    }

}

pub mod directive {
    //! Directive Expander: decomposes directive text into a [`DirectiveRecord`].
    //!
    //! Both grammars search the whole text (dot matches newline), so a directive may sit
    //! anywhere inside a multi-line blob. Text matching neither degrades to an empty record
    //! through [`unrecognized`] unless the caller asks for [`DirectivePolicy::Strict`].

    use crate::core::{DirectiveKind, DirectiveRecord, DisplayMode, WorksheetError};
    use log::debug;
    use once_cell::sync::Lazy;
    use regex::Regex;

    /// `% display (table|default|inline)` anywhere in the text.
    pub(crate) static DISPLAY_DIRECTIVE: Lazy<Regex> = Lazy::new(|| {
        Regex::new(r"(?s)^.*% display (table|default|inline).*$")
            .expect("display directive pattern")
    });

    /// `% <name>: (image|metadata)/<path>` anywhere in the text.
    pub(crate) static FIELD_DIRECTIVE: Lazy<Regex> = Lazy::new(|| {
        Regex::new(r"(?s)^.*% ([^:]+): (image|metadata)/(.*)$").expect("field directive pattern")
    });

    /// What to do with directive text that matches no directive grammar.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
    pub enum DirectivePolicy {
        /// Accept it as an empty, no-op directive.
        #[default]
        Lenient,
        /// Reject it with [`WorksheetError::UnrecognizedDirective`].
        Strict,
    }

    /// Expand directive text, degrading silently when nothing matches.
    pub fn expand(raw: &str) -> DirectiveRecord {
        match_directive(raw).unwrap_or_else(|| unrecognized(raw))
    }

    pub fn expand_with(raw: &str, policy: DirectivePolicy) -> Result<DirectiveRecord, WorksheetError> {
        match match_directive(raw) {
            Some(record) => Ok(record),
            None => match policy {
                DirectivePolicy::Lenient => Ok(unrecognized(raw)),
                DirectivePolicy::Strict => {
                    Err(WorksheetError::UnrecognizedDirective(raw.to_string()))
                }
            },
        }
    }

    /// The single fallback for unmatched directive text: every optional field absent.
    pub fn unrecognized(raw: &str) -> DirectiveRecord {
        debug!("directive {:?} matches no grammar; keeping it as a no-op", raw);
        DirectiveRecord {
            directive: None,
            name: None,
            path: None,
            markup: raw.to_string(),
            display: None,
        }
    }

    fn match_directive(raw: &str) -> Option<DirectiveRecord> {
        if let Some(caps) = DISPLAY_DIRECTIVE.captures(raw) {
            return Some(DirectiveRecord {
                directive: Some(DirectiveKind::Display),
                name: None,
                path: None,
                markup: caps[0].to_string(),
                display: DisplayMode::from_name(&caps[1]),
            });
        }
        let caps = FIELD_DIRECTIVE.captures(raw)?;
        Some(DirectiveRecord {
            directive: DirectiveKind::from_binding(&caps[2]),
            name: Some(caps[1].to_string()),
            path: Some(caps[3].to_string()),
            markup: caps[0].to_string(),
            display: None,
        })
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn display_directive() {
            let d = expand("% display table");
            assert_eq!(d.directive, Some(DirectiveKind::Display));
            assert_eq!(d.display, Some(DisplayMode::Table));
            assert_eq!(d.markup, "% display table");
            assert!(d.name.is_none() && d.path.is_none());
        }

        #[test]
        fn field_directives() {
            let d = expand("% plot: image/out/plot.png");
            assert_eq!(d.directive, Some(DirectiveKind::Image));
            assert_eq!(d.name.as_deref(), Some("plot"));
            assert_eq!(d.path.as_deref(), Some("out/plot.png"));
            assert!(d.display.is_none());

            let d = expand("% time taken: metadata/time");
            assert_eq!(d.directive, Some(DirectiveKind::Metadata));
            assert_eq!(d.name.as_deref(), Some("time taken"));
            assert_eq!(d.path.as_deref(), Some("time"));
        }

        #[test]
        fn display_wins_over_field_in_the_same_text() {
            let d = expand("% x: image/y % display inline");
            assert_eq!(d.directive, Some(DirectiveKind::Display));
            assert_eq!(d.display, Some(DisplayMode::Inline));
            assert!(d.name.is_none());
        }

        #[test]
        fn directive_inside_multiline_blob() {
            let blob = "intro\n% display default\ntrailer";
            let d = expand(blob);
            assert_eq!(d.display, Some(DisplayMode::Default));
            assert_eq!(d.markup, blob);
        }

        #[test]
        fn unmatched_text_degrades_to_empty_record() {
            let d = expand("% display sideways");
            assert_eq!(d.directive, None);
            assert_eq!(d.name, None);
            assert_eq!(d.path, None);
            assert_eq!(d.display, None);
            assert_eq!(d.markup, "% display sideways");
        }

        #[test]
        fn strict_policy_reports_unmatched_text() {
            let err = expand_with("% nothing here", DirectivePolicy::Strict).expect_err("strict");
            assert_eq!(err.to_string(), "unrecognized directive \"% nothing here\"");
            assert!(expand_with("% display table", DirectivePolicy::Strict).is_ok());
        }
    }
}

pub mod parser {
    //! Pattern Table and Line Classifier.
    //!
    //! Every line classifies to exactly one item, or to nothing when it is a `//` comment.
    //! Patterns are tried in table order and the first match wins; order is part of the
    //! grammar. Lines matching no pattern become plain markup, so classification is total.

    use crate::core::WorksheetItem;
    use crate::directive::{self, DISPLAY_DIRECTIVE, FIELD_DIRECTIVE};
    use once_cell::sync::Lazy;
    use regex::{Captures, Regex};

    pub const COMMENT_PREFIX: &str = "//";

    static BUNDLE_LINE: Lazy<Regex> = Lazy::new(|| {
        Regex::new(r"^(\[(.*)\])?\s*\{(.*)\}$").expect("bundle line pattern")
    });

    static TITLE_LINE: Lazy<Regex> =
        Lazy::new(|| Regex::new(r"^%\s*title:\s*(.*)$").expect("title pattern"));

    static DESCRIPTION_LINE: Lazy<Regex> =
        Lazy::new(|| Regex::new(r"^%\s*description:\s*(.*)$").expect("description pattern"));

    type Constructor = fn(&Captures<'_>) -> WorksheetItem;

    /// One entry of the pattern table: a line grammar and the item it builds.
    pub struct LinePattern {
        pub name: &'static str,
        pub regex: &'static Regex,
        construct: Constructor,
    }

    impl LinePattern {
        pub fn apply(&self, line: &str) -> Option<WorksheetItem> {
            self.regex.captures(line).map(|caps| (self.construct)(&caps))
        }
    }

    /// Ordered, immutable pattern table shared by every classification.
    pub static PATTERN_TABLE: Lazy<[LinePattern; 5]> = Lazy::new(|| {
        [
            LinePattern {
                name: "bundle",
                regex: &BUNDLE_LINE,
                construct: bundle_item,
            },
            LinePattern {
                name: "display",
                regex: &DISPLAY_DIRECTIVE,
                construct: directive_item,
            },
            LinePattern {
                name: "field",
                regex: &FIELD_DIRECTIVE,
                construct: directive_item,
            },
            LinePattern {
                name: "title",
                regex: &TITLE_LINE,
                construct: title_item,
            },
            LinePattern {
                name: "description",
                regex: &DESCRIPTION_LINE,
                construct: description_item,
            },
        ]
    });

    fn bundle_item(caps: &Captures<'_>) -> WorksheetItem {
        WorksheetItem::Bundle {
            bundle_uuid: caps[3].trim().to_string(),
            value: caps.get(2).map(|m| m.as_str().trim().to_string()),
        }
    }

    fn directive_item(caps: &Captures<'_>) -> WorksheetItem {
        WorksheetItem::Directive {
            value: directive::expand(&caps[0]),
        }
    }

    fn title_item(caps: &Captures<'_>) -> WorksheetItem {
        WorksheetItem::Title {
            value: caps[1].to_string(),
        }
    }

    fn description_item(caps: &Captures<'_>) -> WorksheetItem {
        WorksheetItem::Description {
            value: caps[1].to_string(),
        }
    }

    /// Classify one line. Returns `None` for comments.
    pub fn classify_line(line: &str) -> Option<WorksheetItem> {
        let line = trim_ascii_space(line);
        if line.starts_with(COMMENT_PREFIX) {
            return None;
        }
        let item = PATTERN_TABLE
            .iter()
            .find_map(|pattern| pattern.apply(line))
            .unwrap_or_else(|| WorksheetItem::markup(line));
        Some(item)
    }

    /// Classify every line of an edited form, preserving order and dropping comments.
    pub fn parse_worksheet_form<I, S>(lines: I) -> Vec<WorksheetItem>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        lines
            .into_iter()
            .filter_map(|line| classify_line(line.as_ref()))
            .collect()
    }

    /// Classify a whole text form.
    pub fn parse_worksheet_text(text: &str) -> Vec<WorksheetItem> {
        let mut lines: Vec<String> = text.lines().map(str::to_string).collect();
        trim_trailing_blank(&mut lines);
        parse_worksheet_form(lines)
    }

    /// Strip one trailing `\n`, then one trailing `\r`.
    pub fn strip_line_ending(line: &str) -> &str {
        let line = line.strip_suffix('\n').unwrap_or(line);
        line.strip_suffix('\r').unwrap_or(line)
    }

    /// Trim the ASCII whitespace set (space, `\t`, `\n`, `\r`, `\x0b`, `\x0c`); other
    /// Unicode spaces such as U+00A0 are content.
    pub fn trim_ascii_space(line: &str) -> &str {
        line.trim_matches(|c: char| matches!(c, ' ' | '\t' | '\n' | '\r' | '\x0b' | '\x0c'))
    }

    /// Drop blank lines after the last non-blank one.
    pub fn trim_trailing_blank(lines: &mut Vec<String>) {
        while lines.last().is_some_and(|l| trim_ascii_space(l).is_empty()) {
            lines.pop();
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use crate::core::{BundleInfo, DirectiveKind, DisplayMode, ItemKind};
        use crate::render::render_item;

        #[test]
        fn pattern_table_order_is_fixed() {
            let names: Vec<_> = PATTERN_TABLE.iter().map(|p| p.name).collect();
            assert_eq!(names, ["bundle", "display", "field", "title", "description"]);
        }

        #[test]
        fn bundle_line_with_annotation() {
            let item = classify_line("[my favorite bundle]{a1b2c3}").expect("item");
            assert_eq!(
                item,
                WorksheetItem::bundle("a1b2c3", Some("my favorite bundle".into()))
            );
        }

        #[test]
        fn bundle_line_without_annotation_and_with_padding() {
            assert_eq!(
                classify_line("{ a1b2c3 }"),
                Some(WorksheetItem::bundle("a1b2c3", None))
            );
            assert_eq!(
                classify_line("  [ note ]   { x }  "),
                Some(WorksheetItem::bundle("x", Some("note".into())))
            );
        }

        #[test]
        fn bundle_grammar_takes_precedence() {
            let item = classify_line("{x % display table}").expect("item");
            assert_eq!(item.kind(), ItemKind::Bundle);
            assert_eq!(item.bundle_uuid(), Some("x % display table"));

            let item = classify_line("[% title: nope]{y}").expect("item");
            assert_eq!(item.kind(), ItemKind::Bundle);
        }

        #[test]
        fn display_directive_line() {
            match classify_line("% display table") {
                Some(WorksheetItem::Directive { value }) => {
                    assert_eq!(value.directive, Some(DirectiveKind::Display));
                    assert_eq!(value.display, Some(DisplayMode::Table));
                    assert_eq!(value.markup, "% display table");
                }
                other => panic!("expected directive, got {:?}", other),
            }
        }

        #[test]
        fn directive_found_mid_line_keeps_whole_line() {
            match classify_line("see below % display inline please") {
                Some(WorksheetItem::Directive { value }) => {
                    assert_eq!(value.display, Some(DisplayMode::Inline));
                    assert_eq!(value.markup, "see below % display inline please");
                }
                other => panic!("expected directive, got {:?}", other),
            }
        }

        #[test]
        fn field_directive_line() {
            match classify_line("% loss curve: image/plots/loss.png") {
                Some(WorksheetItem::Directive { value }) => {
                    assert_eq!(value.directive, Some(DirectiveKind::Image));
                    assert_eq!(value.name.as_deref(), Some("loss curve"));
                    assert_eq!(value.path.as_deref(), Some("plots/loss.png"));
                }
                other => panic!("expected directive, got {:?}", other),
            }
        }

        #[test]
        fn title_and_description_lines() {
            assert_eq!(
                classify_line("% title: My Worksheet"),
                Some(WorksheetItem::Title {
                    value: "My Worksheet".into()
                })
            );
            assert_eq!(
                classify_line("%title:Compact"),
                Some(WorksheetItem::Title {
                    value: "Compact".into()
                })
            );
            assert_eq!(
                classify_line("%  description:   Runs for the paper"),
                Some(WorksheetItem::Description {
                    value: "Runs for the paper".into()
                })
            );
        }

        #[test]
        fn display_grammar_beats_title_grammar() {
            let item = classify_line("% title: % display table").expect("item");
            assert_eq!(item.kind(), ItemKind::Directive);
        }

        #[test]
        fn comments_are_dropped() {
            assert_eq!(classify_line("// just a comment"), None);
            assert_eq!(classify_line("   // indented"), None);
            assert_eq!(classify_line("//[x]{y}"), None);
            assert_eq!(classify_line("// % display table"), None);
        }

        #[test]
        fn everything_else_is_markup() {
            for line in ["plain text", "", "% display sideways", "[open", "{", "%", "% :image/x"] {
                let item = classify_line(line).expect("item");
                assert_eq!(item, WorksheetItem::markup(line), "line {:?}", line);
            }
        }

        #[test]
        fn classification_is_total() {
            let odd = [
                "\u{1F600} ünïcödé",
                "\t\t",
                "[]{}",
                "{}}{",
                "%%%%",
                "% title:",
                "/ not a comment",
                "\r",
            ];
            for line in odd {
                assert!(classify_line(line).is_some(), "line {:?}", line);
            }
        }

        #[test]
        fn well_formed_lines_round_trip() {
            let complete = BundleInfo::new("a1b2c3", Some("run".into()));
            let lines = [
                "[my favorite bundle]{a1b2c3}",
                "[]{a1b2c3}",
                "% display table",
                "% display default",
                "notes % display inline",
                "% accuracy: metadata/stats/accuracy",
                "% plot: image/plot.png",
                "% title: My Worksheet",
                "% description: Experiments",
                "Some *markdown* text.",
                "",
            ];
            for line in lines {
                let item = classify_line(line).expect("item");
                let rendered = render_item(&item, Some(&complete));
                assert_eq!(rendered, vec![line.to_string()], "line {:?}", line);
            }
        }

        #[test]
        fn form_preserves_order_and_skips_comments() {
            let items = parse_worksheet_form([
                "// header",
                "% title: T",
                "intro",
                "// another",
                "{u1}",
            ]);
            let kinds: Vec<_> = items.iter().map(|i| i.kind()).collect();
            assert_eq!(kinds, [ItemKind::Title, ItemKind::Markup, ItemKind::Bundle]);
        }

        #[test]
        fn text_form_ignores_trailing_blank_lines() {
            let items = parse_worksheet_text("a\r\n\r\nb\n\n   \n");
            assert_eq!(
                items,
                vec![
                    WorksheetItem::markup("a"),
                    WorksheetItem::markup(""),
                    WorksheetItem::markup("b"),
                ]
            );
        }

        #[test]
        fn only_ascii_whitespace_is_trimmed() {
            assert_eq!(
                classify_line("\u{a0}note\u{a0}"),
                Some(WorksheetItem::markup("\u{a0}note\u{a0}"))
            );
            assert_eq!(
                classify_line(" \t\x0b\x0cnote\r\n"),
                Some(WorksheetItem::markup("note"))
            );
            assert_eq!(classify_line("\u{a0}// not a comment").map(|i| i.kind()), Some(ItemKind::Markup));
            assert_eq!(trim_ascii_space("\u{2003}x "), "\u{2003}x");
        }

        #[test]
        fn line_endings_are_stripped_once() {
            assert_eq!(strip_line_ending("x\r\n"), "x");
            assert_eq!(strip_line_ending("x\n"), "x");
            assert_eq!(strip_line_ending("x\n\n"), "x\n");
            assert_eq!(strip_line_ending("x"), "x");
        }
    }

}

pub mod render {
    //! Line Renderer: the inverse of the classifier.

    use crate::core::{BundleInfo, WorksheetInfo, WorksheetItem};

    pub const BROKEN_REFERENCE_COMMENT: &str = "// The following bundle reference is broken:";

    /// Render one item. `bundle` is the store's record for a bundle reference; a missing
    /// record or one without a type adds the broken-reference comment.
    pub fn render_item(item: &WorksheetItem, bundle: Option<&BundleInfo>) -> Vec<String> {
        let mut out = Vec::with_capacity(1);
        push_item_lines(&mut out, item, bundle);
        out
    }

    /// Rendered lines for every item of the worksheet, in order.
    pub fn worksheet_lines(info: &WorksheetInfo) -> Vec<String> {
        let mut out = Vec::with_capacity(info.items.len());
        for item in &info.items {
            let bundle = item.bundle_uuid().and_then(|uuid| info.bundle(uuid));
            push_item_lines(&mut out, item, bundle);
        }
        out
    }

    fn push_item_lines(out: &mut Vec<String>, item: &WorksheetItem, bundle: Option<&BundleInfo>) {
        match item {
            // Verbatim, not rebuilt from the sub-fields.
            WorksheetItem::Directive { value } => out.push(value.markup.clone()),
            WorksheetItem::Title { value } | WorksheetItem::Description { value } => {
                out.push(format!("% {}: {}", item.kind(), value))
            }
            WorksheetItem::Markup { value } => out.push(value.clone()),
            WorksheetItem::Bundle { bundle_uuid, value } => {
                if !bundle.is_some_and(BundleInfo::is_complete) {
                    out.push(BROKEN_REFERENCE_COMMENT.to_string());
                }
                out.push(format!(
                    "[{}]{{{}}}",
                    value.as_deref().unwrap_or(""),
                    bundle_uuid
                ));
            }
        }
    }

}

pub mod form {
    //! Form Session: the full-text edit round trip.
    //!
    //! The current worksheet is rendered below a fixed comment header, handed to an
    //! [`EditService`], and the returned lines are classified into the new item list.
    //! An edit that returns the template untouched fails with [`WorksheetError::NoChange`].

    use crate::core::{WorksheetError, WorksheetInfo, WorksheetItem};
    use crate::parser::{parse_worksheet_form, strip_line_ending, trim_trailing_blank};
    use crate::render::worksheet_lines;
    use anyhow::{Context, Result};
    use log::debug;

    /// Presents a template for editing. Blocks until the edit is over.
    pub trait EditService {
        /// Return the edited text as lines, or the template's own lines if the user aborted.
        fn edit(&self, template: &str) -> Result<Vec<String>>;
    }

    /// Instructional comment block placed above the rendered items.
    pub fn template_header(name: &str) -> Vec<String> {
        vec![
            format!(
                "// Full-text editing for worksheet {}. This file is basically Markdown, except",
                name
            ),
            "// that // is used for comments and that lines of the form {bundle_spec} are".into(),
            "// resolved as links to bundles. You can even preface the curly braces".into(),
            "// with bracketed help text, like so: [some explanatory text]{bundle_spec}".into(),
        ]
    }

    pub fn template_lines(info: &WorksheetInfo) -> Vec<String> {
        let mut lines = template_header(&info.name);
        lines.extend(worksheet_lines(info));
        lines
    }

    /// Run one edit round trip and return the items the user wrote.
    pub fn request_new_items(
        info: &WorksheetInfo,
        service: &impl EditService,
    ) -> Result<Vec<WorksheetItem>> {
        let template_lines = template_lines(info);
        let template = template_lines.join("\n");
        debug!(
            "editing worksheet {} ({} template lines)",
            info.uuid,
            template_lines.len()
        );

        let edited = service
            .edit(&template)
            .with_context(|| format!("editing worksheet {}", info.name))?;
        let mut form_result: Vec<String> = edited
            .iter()
            .map(|line| strip_line_ending(line).to_string())
            .collect();
        // Rendered items may span several lines, so compare against the joined text.
        if form_result.iter().map(String::as_str).eq(template.split('\n')) {
            return Err(WorksheetError::NoChange.into());
        }

        trim_trailing_blank(&mut form_result);
        let items = parse_worksheet_form(&form_result);
        debug!("edited form produced {} items", items.len());
        Ok(items)
    }

    /// Edit the worksheet in place.
    pub fn apply_edit(info: &mut WorksheetInfo, service: &impl EditService) -> Result<()> {
        let items = request_new_items(info, service)?;
        info.update_items(items);
        Ok(())
    }

}

pub mod storage {
    //! Persistence of worksheets as JSON documents.
    //!
    //! Items are stored as flat rows with directives kept as their raw text, and expanded
    //! again when a document is loaded.

    use crate::core::{BundleInfo, ItemRow, WorksheetError, WorksheetId, WorksheetInfo, WorksheetItem};
    use crate::directive::DirectivePolicy;
    use anyhow::{Context, Result};
    use serde::{Deserialize, Serialize};
    use std::{fs, path::Path};

    /// On-disk shape of a worksheet.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct WorksheetDocument {
        pub uuid: WorksheetId,
        pub name: String,
        #[serde(default)]
        pub items: Vec<ItemRow>,
        #[serde(default)]
        pub bundles: Vec<BundleInfo>,
    }

    impl WorksheetDocument {
        pub fn from_info(info: &WorksheetInfo) -> Self {
            Self {
                uuid: info.uuid,
                name: info.name.clone(),
                items: info.items.iter().map(WorksheetItem::to_row).collect(),
                bundles: info.bundles.values().cloned().collect(),
            }
        }

        pub fn into_info(self, policy: DirectivePolicy) -> Result<WorksheetInfo, WorksheetError> {
            let items = self
                .items
                .into_iter()
                .map(|row| WorksheetItem::from_row(row, policy))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(WorksheetInfo {
                uuid: self.uuid,
                name: self.name,
                items,
                bundles: self
                    .bundles
                    .into_iter()
                    .map(|b| (b.uuid.clone(), b))
                    .collect(),
            })
        }
    }

    pub trait WorksheetRepository {
        fn load(&self, path: &Path, policy: DirectivePolicy) -> Result<WorksheetInfo>;
        fn save(&self, path: &Path, info: &WorksheetInfo) -> Result<()>;
    }

    /// Repository backed by pretty-printed JSON files.
    pub struct JsonWorksheetRepository;

    impl WorksheetRepository for JsonWorksheetRepository {
        fn load(&self, path: &Path, policy: DirectivePolicy) -> Result<WorksheetInfo> {
            let text =
                fs::read_to_string(path).with_context(|| format!("reading {:?}", path))?;
            let doc: WorksheetDocument = serde_json::from_str(&text)
                .with_context(|| format!("decoding worksheet {:?}", path))?;
            let info = doc
                .into_info(policy)
                .with_context(|| format!("loading items of {:?}", path))?;
            Ok(info)
        }

        fn save(&self, path: &Path, info: &WorksheetInfo) -> Result<()> {
            let mut json = serde_json::to_string_pretty(&WorksheetDocument::from_info(info))?;
            json.push('\n');
            fs::write(path, json.as_bytes()).with_context(|| format!("writing {:?}", path))
        }
    }

}

pub use directive::{DirectivePolicy, expand as expand_directive};
pub use form::{EditService, request_new_items};
pub use parser::{classify_line, parse_worksheet_form, parse_worksheet_text};
pub use render::{render_item, worksheet_lines};
