use std::collections::BTreeMap;

use super::TaskId;

/// Concatenate sections under their canonical headings in task order,
/// skipping empty sections.
pub fn merge_sections(sections: &BTreeMap<TaskId, String>) -> String {
    sections
        .iter()
        .filter(|(_, body)| !body.trim().is_empty())
        .map(|(task, body)| format!("## {}\n\n{}", task.heading(), body.trim()))
        .collect::<Vec<_>>()
        .join("\n\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_order_is_fixed() {
        let mut sections = BTreeMap::new();
        sections.insert(TaskId::EvidencePack, "quote".to_string());
        sections.insert(TaskId::RoleCards, "Lin".to_string());
        let merged = merge_sections(&sections);
        assert_eq!(merged, "## Role Cards\n\nLin\n\n## Evidence Pack\n\nquote");
    }

    #[test]
    fn test_merge_skips_empty_sections() {
        let mut sections = BTreeMap::new();
        sections.insert(TaskId::RoleCards, "Lin".to_string());
        sections.insert(TaskId::StyleGuide, "   ".to_string());
        let merged = merge_sections(&sections);
        assert!(!merged.contains("Style Guide"));
    }

    #[test]
    fn test_merge_is_deterministic() {
        let mut a = BTreeMap::new();
        let mut b = BTreeMap::new();
        for task in TaskId::ALL.iter().rev() {
            a.insert(*task, task.heading().to_lowercase());
        }
        for task in TaskId::ALL {
            b.insert(task, task.heading().to_lowercase());
        }
        assert_eq!(merge_sections(&a), merge_sections(&b));
    }
}
