use tracing::warn;

/// A recoverable problem worth a single grep-able log line.
#[derive(Debug, Default, Clone, Copy)]
pub struct WarnEvent<'a> {
    pub code: &'a str,
    pub stage: &'a str,
    pub action: &'a str,
    pub observation: &'a str,
    pub plane: &'a str,
    pub reason: &'a str,
    pub err: &'a str,
}

fn sanitize_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut prev_sep = false;
    for ch in value.chars() {
        if ch.is_ascii_whitespace() {
            if !out.is_empty() && !prev_sep {
                out.push('_');
                prev_sep = true;
            }
        } else if ch.is_ascii_graphic() {
            out.push(ch);
            prev_sep = false;
        }
    }
    let trimmed = out.trim_matches('_');
    if trimmed.is_empty() {
        "na".to_string()
    } else {
        trimmed.to_string()
    }
}

pub fn render(event: &WarnEvent<'_>) -> String {
    format!(
        "JSA_WARN code={} stage={} action={} observation={} plane={} reason={} err={}",
        sanitize_value(event.code),
        sanitize_value(event.stage),
        sanitize_value(event.action),
        sanitize_value(event.observation),
        sanitize_value(event.plane),
        sanitize_value(event.reason),
        sanitize_value(event.err),
    )
}

pub fn emit(event: WarnEvent<'_>) {
    warn!("{}", render(&event));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_value_rewrites_whitespace() {
        assert_eq!(sanitize_value("a b\tc"), "a_b_c");
    }

    #[test]
    fn render_fills_missing_fields() {
        let line = render(&WarnEvent {
            code: "PROVENANCE_DROPPED",
            stage: "resolve",
            reason: "not in archive or batch",
            ..WarnEvent::default()
        });
        assert_eq!(
            line,
            "JSA_WARN code=PROVENANCE_DROPPED stage=resolve action=na observation=na plane=na reason=not_in_archive_or_batch err=na"
        );
    }
}
