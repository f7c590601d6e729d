//! Rule table translating raw plugin events into semantic events.
//!
//! A rule matches on the sending worker, the raw event name and optionally on
//! payload values, and produces zero or more events whose names and payloads
//! are templates over the raw payload. The first matching rule wins; an event
//! no rule matches passes through unchanged.

use jukebox_core::{Event, Payload, PayloadValue};
use serde::Deserialize;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Rules shipped with the supervisor.
pub const BUILTIN_RULES: &str = include_str!("../defaults/eventmap.toml");

const ORIGIN_PLACEHOLDER: &str = "@origin";
const EVENT_PLACEHOLDER: &str = "@event";

#[derive(Debug, Error)]
pub enum EventMapError {
    #[error("failed to read event map at {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse event map {source_name}: {source}")]
    Parse {
        source_name: String,
        source: toml::de::Error,
    },
}

/// A template referenced something the raw event does not carry.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MappingError {
    #[error("output '{output}' references missing payload field '{field}'")]
    MissingField { output: String, field: String },
}

/// Name pattern: `*` matches anything, `prefix*` matches by prefix, anything
/// else matches exactly.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(from = "String")]
pub enum Pattern {
    #[default]
    Any,
    Prefix(String),
    Exact(String),
}

impl Pattern {
    pub fn parse(raw: &str) -> Self {
        match raw.strip_suffix('*') {
            Some("") => Pattern::Any,
            Some(prefix) => Pattern::Prefix(prefix.to_string()),
            None => Pattern::Exact(raw.to_string()),
        }
    }

    pub fn matches(&self, value: &str) -> bool {
        match self {
            Pattern::Any => true,
            Pattern::Prefix(prefix) => value.starts_with(prefix.as_str()),
            Pattern::Exact(exact) => value == exact,
        }
    }
}

impl From<String> for Pattern {
    fn from(value: String) -> Self {
        Pattern::parse(&value)
    }
}

impl From<&str> for Pattern {
    fn from(value: &str) -> Self {
        Pattern::parse(value)
    }
}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Pattern::Any => f.write_str("*"),
            Pattern::Prefix(prefix) => write!(f, "{prefix}*"),
            Pattern::Exact(exact) => f.write_str(exact),
        }
    }
}

/// The `match` part of a rule; two rules with equal matchers override each
/// other across layers.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Matcher {
    #[serde(default)]
    pub origin: Pattern,
    pub raw_event: Pattern,
    /// Payload fields that must be present with these values (compared by
    /// their text form).
    #[serde(default)]
    pub payload: Payload,
}

impl Matcher {
    pub fn matches(&self, raw: &Event) -> bool {
        self.origin.matches(raw.origin().as_str())
            && self.raw_event.matches(raw.name())
            && self.payload.iter().all(|(key, expected)| {
                raw.field(key)
                    .is_some_and(|actual| actual.to_string() == expected.to_string())
            })
    }
}

/// One event a rule produces.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Output {
    pub event: String,
    #[serde(default)]
    pub payload: Payload,
}

impl Output {
    pub fn new(event: impl Into<String>) -> Self {
        Self {
            event: event.into(),
            payload: Payload::new(),
        }
    }

    pub fn with_template(mut self, key: impl Into<String>, value: impl Into<PayloadValue>) -> Self {
        self.payload.insert(key.into(), value.into());
        self
    }

    fn render(&self, raw: &Event) -> Result<Event, MappingError> {
        let name = render_text(&self.event, &self.event, raw)?;
        let mut payload = Payload::new();
        for (key, template) in &self.payload {
            payload.insert(key.clone(), render_value(&self.event, template, raw)?);
        }
        Ok(Event::new(name, raw.origin().clone()).with_payload(payload))
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Rule {
    #[serde(rename = "match")]
    pub matcher: Matcher,
    #[serde(default)]
    pub produces: Vec<Output>,
}

impl Rule {
    pub fn new(origin: impl Into<Pattern>, raw_event: impl Into<Pattern>) -> Self {
        Self {
            matcher: Matcher {
                origin: origin.into(),
                raw_event: raw_event.into(),
                payload: Payload::new(),
            },
            produces: Vec::new(),
        }
    }

    /// Require a payload field value.
    pub fn when(mut self, key: impl Into<String>, value: impl Into<PayloadValue>) -> Self {
        self.matcher.payload.insert(key.into(), value.into());
        self
    }

    pub fn produce(mut self, output: Output) -> Self {
        self.produces.push(output);
        self
    }
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.matcher.origin, self.matcher.raw_event)?;
        for (key, value) in &self.matcher.payload {
            write!(f, " [{key}={value}]")?;
        }
        let outputs: Vec<&str> = self.produces.iter().map(|o| o.event.as_str()).collect();
        if outputs.is_empty() {
            write!(f, " -> (dropped)")
        } else {
            write!(f, " -> {}", outputs.join(", "))
        }
    }
}

#[derive(Debug, Deserialize)]
struct RuleFile {
    #[serde(default, rename = "rule")]
    rules: Vec<Rule>,
}

/// The merged, immutable rule table.
#[derive(Debug, Clone, Default)]
pub struct EventMap {
    rules: Vec<Rule>,
}

impl EventMap {
    pub fn from_rules(rules: Vec<Rule>) -> Self {
        Self { rules }
    }

    /// Merge two layers: user rules first, then every default rule whose
    /// matcher is not overridden by a user rule.
    pub fn layered(defaults: Vec<Rule>, user: Vec<Rule>) -> Self {
        let mut rules = user;
        let overridden = defaults
            .into_iter()
            .filter(|default| !rules.iter().any(|u| u.matcher == default.matcher))
            .collect::<Vec<_>>();
        rules.extend(overridden);
        Self { rules }
    }

    /// Built-in rules overlaid with the user's file, which may be absent.
    pub fn load(user_path: &Path) -> Result<Self, EventMapError> {
        let defaults = parse_rules(BUILTIN_RULES, "built-in defaults")?;
        let user = match fs::read_to_string(user_path) {
            Ok(contents) => parse_rules(&contents, &user_path.display().to_string())?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %user_path.display(), "no user event map");
                Vec::new()
            }
            Err(source) => {
                return Err(EventMapError::Io {
                    path: user_path.to_path_buf(),
                    source,
                })
            }
        };
        tracing::info!(
            defaults = defaults.len(),
            user = user.len(),
            "event map loaded"
        );
        Ok(Self::layered(defaults, user))
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    /// Translate one raw event, logging and skipping outputs that fail.
    pub fn translate(&self, raw: &Event) -> Vec<Event> {
        let (events, errors) = self.translate_checked(raw);
        for err in errors {
            tracing::warn!(origin = %raw.origin(), event = raw.name(), error = %err, "mapping output skipped");
        }
        events
    }

    /// Like [`EventMap::translate`] but hands back the per-output failures.
    pub fn translate_checked(&self, raw: &Event) -> (Vec<Event>, Vec<MappingError>) {
        let Some(rule) = self.rules.iter().find(|rule| rule.matcher.matches(raw)) else {
            return (vec![raw.clone()], Vec::new());
        };

        let mut events = Vec::with_capacity(rule.produces.len());
        let mut errors = Vec::new();
        for output in &rule.produces {
            match output.render(raw) {
                Ok(event) => events.push(event),
                Err(err) => errors.push(err),
            }
        }
        (events, errors)
    }
}

pub fn parse_rules(source: &str, source_name: &str) -> Result<Vec<Rule>, EventMapError> {
    let file: RuleFile = toml::from_str(source).map_err(|source| EventMapError::Parse {
        source_name: source_name.to_string(),
        source,
    })?;
    Ok(file.rules)
}

fn lookup(output: &str, field: &str, raw: &Event) -> Result<PayloadValue, MappingError> {
    match field {
        ORIGIN_PLACEHOLDER => Ok(PayloadValue::Text(raw.origin().to_string())),
        EVENT_PLACEHOLDER => Ok(PayloadValue::Text(raw.name().to_string())),
        _ => raw
            .field(field)
            .cloned()
            .ok_or_else(|| MappingError::MissingField {
                output: output.to_string(),
                field: field.to_string(),
            }),
    }
}

fn render_value(
    output: &str,
    template: &PayloadValue,
    raw: &Event,
) -> Result<PayloadValue, MappingError> {
    let PayloadValue::Text(text) = template else {
        return Ok(template.clone());
    };
    // A lone placeholder keeps the referenced value's type.
    if let Some(field) = sole_placeholder(text) {
        return lookup(output, field, raw);
    }
    render_text(output, text, raw).map(PayloadValue::Text)
}

fn sole_placeholder(text: &str) -> Option<&str> {
    let inner = text.strip_prefix('{')?.strip_suffix('}')?;
    (!inner.is_empty() && !inner.contains(['{', '}'])).then_some(inner)
}

fn render_text(output: &str, template: &str, raw: &Event) -> Result<String, MappingError> {
    let mut rendered = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(pos) = rest.find(['{', '}']) {
        rendered.push_str(&rest[..pos]);
        let tail = &rest[pos..];
        if tail.starts_with("{{") || tail.starts_with("}}") {
            rendered.push_str(&tail[..1]);
            rest = &tail[2..];
            continue;
        }
        if let (true, Some(end)) = (tail.starts_with('{'), tail.find('}')) {
            let field = &tail[1..end];
            rendered.push_str(&lookup(output, field, raw)?.to_string());
            rest = &tail[end + 1..];
            continue;
        }
        // Stray brace: keep it literally.
        rendered.push_str(&tail[..1]);
        rest = &tail[1..];
    }
    rendered.push_str(rest);
    Ok(rendered)
}

#[cfg(test)]
mod tests {
    use super::*;
    use jukebox_core::{Origin, WorkerId};

    fn raw(origin: &str, name: &str) -> Event {
        Event::new(name, Origin::Worker(WorkerId::new(origin)))
    }

    fn rfid_rule() -> Rule {
        Rule::new("rfid_reader", "raw").produce(
            Output::new("load_source")
                .with_template("use", "Mpdclient")
                .with_template("key", "Music/Band/Album"),
        )
    }

    #[test]
    fn builtin_rules_parse() {
        let rules = parse_rules(BUILTIN_RULES, "built-in").unwrap();
        assert!(!rules.is_empty());
        assert!(rules
            .iter()
            .any(|r| r.matcher.raw_event == Pattern::Exact("power_long".into())));
    }

    #[test]
    fn rfid_raw_becomes_load_source() {
        let map = EventMap::from_rules(vec![rfid_rule()]);
        let event = raw("rfid_reader", "raw").with_field("code", "0123456789");

        let out = map.translate(&event);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].name(), "load_source");
        assert_eq!(out[0].field("use").unwrap().as_text(), Some("Mpdclient"));
        assert_eq!(
            out[0].field("key").unwrap().as_text(),
            Some("Music/Band/Album")
        );
        assert_eq!(out[0].origin(), event.origin());
    }

    #[test]
    fn unmatched_event_passes_through_unchanged() {
        let map = EventMap::from_rules(vec![rfid_rule()]);
        let event = raw("inputgpiod", "12_short").with_field("pin", 12i64);
        assert_eq!(map.translate(&event), vec![event.clone()]);
        // Translating the pass-through again changes nothing either.
        assert_eq!(map.translate(&map.translate(&event)[0]), vec![event]);
    }

    #[test]
    fn first_matching_rule_wins() {
        let map = EventMap::from_rules(vec![
            Rule::new("*", "12_*").produce(Output::new("first")),
            Rule::new("inputgpiod", "12_short").produce(Output::new("second")),
        ]);
        let out = map.translate(&raw("inputgpiod", "12_short"));
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].name(), "first");
    }

    #[test]
    fn payload_conditions_select_rule() {
        let map = EventMap::from_rules(vec![
            Rule::new("rfid_reader", "raw")
                .when("code", "0123456789")
                .produce(Output::new("load_source").with_template("key", "Album A")),
            Rule::new("rfid_reader", "raw")
                .when("code", "9876543210")
                .produce(Output::new("load_source").with_template("key", "Album B")),
        ]);
        let out = map.translate(&raw("rfid_reader", "raw").with_field("code", "9876543210"));
        assert_eq!(out[0].field("key").unwrap().as_text(), Some("Album B"));

        let unknown = raw("rfid_reader", "raw").with_field("code", "1111");
        assert_eq!(map.translate(&unknown), vec![unknown]);
    }

    #[test]
    fn templates_substitute_fields_and_keep_types() {
        let map = EventMap::from_rules(vec![Rule::new("*", "button_*").produce(
            Output::new("pressed_{pin}")
                .with_template("label", "pin {pin} via {@origin}: {{raw}}")
                .with_template("pin", "{pin}")
                .with_template("tags", "{tags}")
                .with_template("fixed", 3i64),
        )]);
        let event = raw("inputgpiod", "button_down")
            .with_field("pin", 12i64)
            .with_field("tags", vec!["a".to_string(), "b".to_string()]);

        let out = map.translate(&event);
        assert_eq!(out[0].name(), "pressed_12");
        assert_eq!(
            out[0].field("label").unwrap().as_text(),
            Some("pin 12 via inputgpiod: {raw}")
        );
        assert_eq!(out[0].field("pin"), Some(&PayloadValue::Integer(12)));
        assert_eq!(
            out[0].field("tags").unwrap().as_list(),
            Some(&["a".to_string(), "b".to_string()][..])
        );
        assert_eq!(out[0].field("fixed"), Some(&PayloadValue::Integer(3)));
    }

    #[test]
    fn missing_field_skips_only_that_output() {
        let map = EventMap::from_rules(vec![Rule::new("*", "raw")
            .produce(Output::new("load_source").with_template("key", "{album}"))
            .produce(Output::new("beep"))]);

        let (events, errors) = map.translate_checked(&raw("rfid_reader", "raw"));
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].name(), "beep");
        assert_eq!(
            errors,
            vec![MappingError::MissingField {
                output: "load_source".into(),
                field: "album".into(),
            }]
        );
    }

    #[test]
    fn rule_without_outputs_swallows_event() {
        let map = EventMap::from_rules(vec![Rule::new("*", "noise")]);
        assert!(map.translate(&raw("inputgpiod", "noise")).is_empty());
    }

    #[test]
    fn user_layer_overrides_identical_matchers() {
        let defaults = vec![
            Rule::new("*", "volume_up").produce(Output::new("volume_increase")),
            Rule::new("*", "power_long").produce(Output::new("shutdown")),
        ];
        let user = vec![Rule::new("*", "volume_up").produce(Output::new("volume_max"))];

        let map = EventMap::layered(defaults, user);
        assert_eq!(map.rules().len(), 2);
        let out = map.translate(&raw("inputgpiod", "volume_up"));
        assert_eq!(out[0].name(), "volume_max");
        let out = map.translate(&raw("inputgpiod", "power_long"));
        assert_eq!(out[0].name(), "shutdown");
    }

    #[test]
    fn load_reads_user_file_over_builtins() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("eventmap.toml");
        fs::write(
            &path,
            r#"
[[rule]]
match = { origin = "rfid_reader", raw_event = "raw", payload = { code = "0123456789" } }
produces = [{ event = "load_source", payload = { use = "Mpdclient", key = "Music/Band/Album" } }]
"#,
        )
        .unwrap();

        let map = EventMap::load(&path).unwrap();
        let out = map.translate(&raw("rfid_reader", "raw").with_field("code", "0123456789"));
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].name(), "load_source");

        // Unknown cards fall through to the built-in complaint.
        let out = map.translate(&raw("rfid_reader", "raw").with_field("code", "5"));
        let names: Vec<_> = out.iter().map(Event::name).collect();
        assert_eq!(names, vec!["error", "beep"]);
    }

    #[test]
    fn missing_user_file_is_fine() {
        let dir = tempfile::tempdir().unwrap();
        let map = EventMap::load(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(
            map.rules().len(),
            parse_rules(BUILTIN_RULES, "built-in").unwrap().len()
        );
    }

    #[test]
    fn malformed_user_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("eventmap.toml");
        fs::write(&path, "[[rule]]\nmatch = 3\n").unwrap();
        assert!(matches!(
            EventMap::load(&path),
            Err(EventMapError::Parse { .. })
        ));
    }

    #[test]
    fn rule_display_is_readable() {
        assert_eq!(
            rfid_rule().when("code", "42").to_string(),
            "rfid_reader/raw [code=42] -> load_source"
        );
    }
}
