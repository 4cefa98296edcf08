use std::fmt::{self, Write as _};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::fmt::{format::Writer, FmtContext, FormatEvent, FormatFields};
use tracing_subscriber::registry::LookupSpan;

const COLOR_RESET: &str = "\x1b[0m";
const COLOR_CYAN: &str = "\x1b[36m";
const COLOR_GREEN: &str = "\x1b[32m";
const COLOR_BRIGHT_YELLOW: &str = "\x1b[93m";
const COLOR_BRIGHT_RED: &str = "\x1b[91m";
const COLOR_BRIGHT_GRAY: &str = "\x1b[90m";

const SOURCE_WIDTH: usize = 18;
const LEVEL_WIDTH: usize = 9;

/// Log with a `component` field, shown as `pairlink-<component>`
macro_rules! component_info {
    ($component:expr, $($arg:tt)*) => {
        tracing::info!(component = $component, $($arg)*)
    };
}

macro_rules! component_warn {
    ($component:expr, $($arg:tt)*) => {
        tracing::warn!(component = $component, $($arg)*)
    };
}

macro_rules! component_error {
    ($component:expr, $($arg:tt)*) => {
        tracing::error!(component = $component, $($arg)*)
    };
}

/// Single-line formatter: `[timestamp] [source] [level] message key=value…`
pub struct PairlinkLogFormatter {
    service_name: String,
    color_enabled: bool,
}

impl PairlinkLogFormatter {
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            color_enabled: is_terminal(),
        }
    }

    pub fn with_color(mut self, enabled: bool) -> Self {
        self.color_enabled = enabled;
        self
    }

    fn source(&self, component: Option<&str>) -> String {
        let name = match component {
            Some(component) => format!("{}-{}", self.service_name, component),
            None => self.service_name.clone(),
        };

        if name.chars().count() > SOURCE_WIDTH {
            let truncated: String = name.chars().take(SOURCE_WIDTH - 1).collect();
            format!("{}…", truncated)
        } else {
            format!("{:<width$}", name, width = SOURCE_WIDTH)
        }
    }

    fn level_label(level: &Level) -> String {
        let label = match *level {
            Level::ERROR => "✗ ERROR",
            Level::WARN => "⚠ WARN",
            Level::INFO => "ℹ INFO",
            Level::DEBUG => "◦ DEBUG",
            Level::TRACE => "◦ TRACE",
        };
        format!("{:<width$}", label, width = LEVEL_WIDTH)
    }

    fn level_color(&self, level: &Level) -> &'static str {
        if !self.color_enabled {
            return "";
        }
        match *level {
            Level::ERROR => COLOR_BRIGHT_RED,
            Level::WARN => COLOR_BRIGHT_YELLOW,
            Level::INFO => COLOR_GREEN,
            Level::DEBUG | Level::TRACE => COLOR_BRIGHT_GRAY,
        }
    }

    fn render(&self, timestamp: &str, level: &Level, fields: &EventFields) -> String {
        let (cyan, reset) = if self.color_enabled {
            (COLOR_CYAN, COLOR_RESET)
        } else {
            ("", "")
        };

        let mut line = format!(
            "{}[{}]{} [{}] [{}{}{}] {}",
            cyan,
            timestamp,
            reset,
            self.source(fields.component.as_deref()),
            self.level_color(level),
            Self::level_label(level),
            reset,
            fields.message
        );
        for (key, value) in &fields.extra {
            write!(line, " {}={}", key, value).ok();
        }
        line
    }
}

impl<S, N> FormatEvent<S, N> for PairlinkLogFormatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        _ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        let timestamp = chrono::Local::now()
            .format("%Y-%m-%d %H:%M:%S%.3f")
            .to_string();

        let mut fields = EventFields::default();
        event.record(&mut fields);

        writeln!(writer, "{}", self.render(&timestamp, event.metadata().level(), &fields))
    }
}

#[derive(Debug, Default)]
struct EventFields {
    message: String,
    component: Option<String>,
    extra: Vec<(&'static str, String)>,
}

impl tracing::field::Visit for EventFields {
    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        match field.name() {
            "message" => self.message = value.to_string(),
            "component" => self.component = Some(value.to_string()),
            name => self.extra.push((name, value.to_string())),
        }
    }

    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn fmt::Debug) {
        let rendered = format!("{:?}", value);
        let unquoted = rendered
            .strip_prefix('"')
            .and_then(|s| s.strip_suffix('"'))
            .map(str::to_string)
            .unwrap_or(rendered);
        self.record_str(field, &unquoted);
    }
}

fn is_terminal() -> bool {
    match std::env::var("TERM") {
        Ok(term) => term != "dumb",
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields(message: &str, component: Option<&str>) -> EventFields {
        EventFields {
            message: message.to_string(),
            component: component.map(str::to_string),
            extra: Vec::new(),
        }
    }

    #[test]
    fn test_source_is_padded_and_truncated() {
        let formatter = PairlinkLogFormatter::new("pairlink").with_color(false);
        assert_eq!(formatter.source(None), format!("{:<18}", "pairlink"));
        assert_eq!(formatter.source(Some("chat")).trim_end(), "pairlink-chat");

        let long = formatter.source(Some("a-very-long-component"));
        assert_eq!(long.chars().count(), SOURCE_WIDTH);
        assert!(long.ends_with('…'));
    }

    #[test]
    fn test_render_plain_line() {
        let formatter = PairlinkLogFormatter::new("pairlink").with_color(false);
        let mut event = fields("Peer discovered", Some("relay"));
        event.extra.push(("room", "K7Q".to_string()));

        let line = formatter.render("2026-01-02 03:04:05.678", &Level::WARN, &event);
        assert!(line.starts_with("[2026-01-02 03:04:05.678] [pairlink-relay"));
        assert!(line.contains("⚠ WARN"));
        assert!(line.ends_with("Peer discovered room=K7Q"));
        assert!(!line.contains('\x1b'));
    }

    #[test]
    fn test_render_colored_level() {
        let formatter = PairlinkLogFormatter::new("pairlink").with_color(true);
        let line = formatter.render("ts", &Level::ERROR, &fields("boom", None));
        assert!(line.contains(COLOR_BRIGHT_RED));
        assert!(line.contains(COLOR_RESET));
    }
}
