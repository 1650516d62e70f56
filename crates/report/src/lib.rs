//! rollcheck report: render tracing events as TeamCity service messages.
//!
//! Each event becomes one `##teamcity[...]` line. The message name comes from
//! the `message_name` field (default `message`), other fields become
//! attributes, and the level maps onto a TeamCity status.
//! See <https://www.jetbrains.com/help/teamcity/service-messages.html>.

#![forbid(unsafe_code)]

use std::fmt;

use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::fmt::{format::Writer, FmtContext, FormatEvent, FormatFields};
use tracing_subscriber::registry::LookupSpan;

pub const STATUS_FAILURE: &str = "FAILURE";
pub const STATUS_ERROR: &str = "ERROR";
pub const STATUS_WARNING: &str = "WARNING";
pub const STATUS_NORMAL: &str = "NORMAL";

/// Field carrying the service message name.
pub const MESSAGE_NAME: &str = "message_name";
pub const MESSAGE_NAME_DEFAULT: &str = "message";
pub const MESSAGE_NAME_BUILD_PROBLEM: &str = "buildProblem";
pub const MESSAGE_NAME_BUILD_STATUS: &str = "buildStatus";
pub const MESSAGE_NAME_BLOCK_OPENED: &str = "blockOpened";

/// Boolean field marking an event that ends the build as failed.
pub const FATAL: &str = "fatal";

/// Event formatter for `tracing_subscriber::fmt().event_format(..)`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TeamcityFormat;

impl<S, N> FormatEvent<S, N> for TeamcityFormat
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(&self, _ctx: &FmtContext<'_, S, N>, mut writer: Writer<'_>, event: &Event<'_>) -> fmt::Result {
        let mut fields = ServiceFields::default();
        event.record(&mut fields);
        writeln!(writer, "{}", render(*event.metadata().level(), &fields))
    }
}

/// Fields of one event, split into the parts a service message needs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceFields {
    pub message: String,
    pub message_name: Option<String>,
    pub status: Option<String>,
    pub fatal: bool,
    /// Remaining fields, in record order.
    pub extra: Vec<(String, String)>,
}

impl ServiceFields {
    fn put(&mut self, name: &str, value: String) {
        match name {
            "message" => self.message = value,
            MESSAGE_NAME => self.message_name = Some(value),
            "status" => self.status = Some(value),
            n if n.starts_with("log.") => {}
            n => self.extra.push((n.to_string(), value)),
        }
    }
}

impl Visit for ServiceFields {
    fn record_str(&mut self, field: &Field, value: &str) {
        self.put(field.name(), value.to_string());
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        if field.name() == FATAL {
            self.fatal = value;
        } else {
            self.put(field.name(), value.to_string());
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        self.put(field.name(), format!("{:?}", value));
    }
}

/// Render one service message line (without the trailing newline).
pub fn render(level: Level, fields: &ServiceFields) -> String {
    let name = fields.message_name.as_deref().unwrap_or(MESSAGE_NAME_DEFAULT);
    let mut out = vec![escape(name)];
    for (k, v) in &fields.extra {
        out.push(format!("{}='{}'", k, escape(v)));
    }
    let status = match &fields.status {
        Some(s) => escape(s),
        None => status_for(level, fields.fatal).to_string(),
    };
    out.push(format!("status='{}'", status));
    let text_key = if name == MESSAGE_NAME_BUILD_PROBLEM || name == MESSAGE_NAME_BLOCK_OPENED { "description" } else { "text" };
    out.push(format!("{}='{}'", text_key, escape(&fields.message)));
    format!("##teamcity[{}]", out.join(" "))
}

pub fn status_for(level: Level, fatal: bool) -> &'static str {
    if fatal {
        return STATUS_FAILURE;
    }
    match level {
        Level::ERROR => STATUS_ERROR,
        Level::WARN => STATUS_WARNING,
        _ => STATUS_NORMAL,
    }
}

/// Escape a value for use inside a service message attribute.
pub fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for ch in text.chars() {
        match ch {
            '|' => out.push_str("||"),
            '\'' => out.push_str("|'"),
            '\n' => out.push_str("|n"),
            '\r' => out.push_str("|r"),
            '[' => out.push_str("|["),
            ']' => out.push_str("|]"),
            c => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::sync::{Arc, Mutex};

    #[test]
    fn escapes_every_special_character_once() {
        assert_eq!(escape("a|b'c\nd\re[f]"), "a||b|'c|nd|re|[f|]");
        assert_eq!(escape("||"), "||||");
        assert_eq!(escape("plain"), "plain");
    }

    #[test]
    fn default_message_uses_text_and_level_status() {
        let fields = ServiceFields { message: "Pod is not ready: x".into(), ..Default::default() };
        assert_eq!(render(Level::WARN, &fields), "##teamcity[message status='WARNING' text='Pod is not ready: x']");
        assert_eq!(render(Level::INFO, &fields), "##teamcity[message status='NORMAL' text='Pod is not ready: x']");
        assert_eq!(render(Level::ERROR, &fields), "##teamcity[message status='ERROR' text='Pod is not ready: x']");
    }

    #[test]
    fn build_problem_uses_description_and_failure_when_fatal() {
        let fields = ServiceFields {
            message: "Deployment progress deadline exceeded".into(),
            message_name: Some(MESSAGE_NAME_BUILD_PROBLEM.into()),
            fatal: true,
            ..Default::default()
        };
        assert_eq!(
            render(Level::ERROR, &fields),
            "##teamcity[buildProblem status='FAILURE' description='Deployment progress deadline exceeded']"
        );
    }

    #[test]
    fn explicit_status_and_extra_fields() {
        let fields = ServiceFields {
            message: "Deployment \"web\" is successful".into(),
            message_name: Some(MESSAGE_NAME_BUILD_STATUS.into()),
            status: Some("SUCCESS".into()),
            extra: vec![("pod".into(), "web-[1]".into())],
            ..Default::default()
        };
        assert_eq!(
            render(Level::INFO, &fields),
            "##teamcity[buildStatus pod='web-|[1|]' status='SUCCESS' text='Deployment \"web\" is successful']"
        );
    }

    #[derive(Clone, Default)]
    struct Buf(Arc<Mutex<Vec<u8>>>);

    impl io::Write for Buf {
        fn write(&mut self, data: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(data);
            Ok(data.len())
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn formats_events_through_subscriber() {
        let buf = Buf::default();
        let writer = buf.clone();
        let subscriber = tracing_subscriber::fmt()
            .event_format(TeamcityFormat)
            .with_writer(move || writer.clone())
            .finish();
        tracing::subscriber::with_default(subscriber, || {
            tracing::warn!(reason = "pod-not-ready", "Pod is not ready: it's [down]");
            tracing::error!(message_name = "buildProblem", fatal = true, "Deployment progress deadline exceeded");
            tracing::info!(pod = %"web-a", attempts = 2u32, "streaming pod logs");
        });
        let out = String::from_utf8(buf.0.lock().unwrap().clone()).expect("utf8");
        let lines: Vec<_> = out.lines().collect();
        assert_eq!(
            lines,
            vec![
                "##teamcity[message reason='pod-not-ready' status='WARNING' text='Pod is not ready: it|'s |[down|]']",
                "##teamcity[buildProblem status='FAILURE' description='Deployment progress deadline exceeded']",
                "##teamcity[message pod='web-a' attempts='2' status='NORMAL' text='streaming pod logs']",
            ]
        );
    }
}
