//! Marker-based section extraction from extraction-task output.

use std::sync::LazyLock;

use regex::Regex;

use super::TaskId;

/// Matches `[NAME]` or `[/NAME]` at the start of a line.
static MARKER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^[ \t]*\[[ \t]*(/?)[ \t]*([A-Za-z][A-Za-z _-]*?)[ \t]*\]")
        .expect("marker regex is valid")
});

/// Accepted marker names for each task's section, canonical name first.
pub fn marker_aliases(task: TaskId) -> &'static [&'static str] {
    match task {
        TaskId::RoleCards => &["ROLE_CARDS", "CHARACTER_CARDS", "CHARACTERS"],
        TaskId::StyleGuide => &["STYLE_GUIDE", "STYLE"],
        TaskId::PlotLedger => &["PLOT_LEDGER", "PLOT", "TIMELINE"],
        TaskId::EvidencePack => &["EVIDENCE_PACK", "EVIDENCE", "QUOTES"],
        TaskId::EroticPack => &["EROTIC_PACK", "EROTIC_CONTENT", "INTIMACY"],
    }
}

fn normalize_marker(name: &str) -> String {
    name.trim().to_uppercase().replace([' ', '-'], "_")
}

fn is_section_marker(name: &str) -> bool {
    TaskId::ALL
        .into_iter()
        .any(|task| marker_aliases(task).contains(&name))
}

/// Extract the section for `task` from `raw`.
///
/// The section starts after the first opening marker matching one of the
/// task's aliases and runs to the next section marker of any task. Other
/// bracketed lines such as `[Note]` stay in the body. Returns `None` when no
/// alias marker is present.
pub fn extract_section(task: TaskId, raw: &str) -> Option<String> {
    let aliases = marker_aliases(task);
    let markers: Vec<_> = MARKER_RE
        .captures_iter(raw)
        .filter(|caps| is_section_marker(&normalize_marker(&caps[2])))
        .collect();

    let open = markers.iter().position(|caps| {
        caps[1].is_empty() && aliases.contains(&normalize_marker(&caps[2]).as_str())
    })?;
    let start = markers[open].get(0)?.end();
    let end = markers
        .get(open + 1)
        .and_then(|caps| caps.get(0))
        .map(|m| m.start())
        .unwrap_or(raw.len());

    Some(raw[start..end].trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extracts_between_markers() {
        let raw = "Preamble\n[ROLE_CARDS]\n- Lin: captain\n- Mei: pilot\n[STYLE_GUIDE]\nterse";
        assert_eq!(
            extract_section(TaskId::RoleCards, raw).as_deref(),
            Some("- Lin: captain\n- Mei: pilot")
        );
        assert_eq!(
            extract_section(TaskId::StyleGuide, raw).as_deref(),
            Some("terse")
        );
    }

    #[test]
    fn test_closing_marker_ends_section() {
        let raw = "[PLOT_LEDGER]\nch1: storm\n[/PLOT_LEDGER]\ntrailing chatter";
        assert_eq!(
            extract_section(TaskId::PlotLedger, raw).as_deref(),
            Some("ch1: storm")
        );
    }

    #[test]
    fn test_unknown_bracket_line_stays_in_section() {
        let raw = "[ROLE_CARDS]\n- Lin: captain\n[Note] Mei is new\n- Mei: pilot\n[STYLE]\nterse";
        assert_eq!(
            extract_section(TaskId::RoleCards, raw).as_deref(),
            Some("- Lin: captain\n[Note] Mei is new\n- Mei: pilot")
        );
    }

    #[test]
    fn test_aliases_and_case() {
        let raw = "[ Evidence ]\n\"I will return.\"";
        assert_eq!(
            extract_section(TaskId::EvidencePack, raw).as_deref(),
            Some("\"I will return.\"")
        );
        let raw = "[character cards] Lin, captain";
        assert_eq!(
            extract_section(TaskId::RoleCards, raw).as_deref(),
            Some("Lin, captain")
        );
    }

    #[test]
    fn test_missing_marker() {
        assert_eq!(extract_section(TaskId::StyleGuide, "just prose"), None);
        assert_eq!(
            extract_section(TaskId::StyleGuide, "[ROLE_CARDS]\nLin"),
            None
        );
    }
}
