//! Mention parsing and rewriting (`spec.md` §4.3): paragraph-start `@name`
//! detection, case-insensitive; self-mention stripping and auto-prepend on
//! the way back out.

/// True if `content` mentions `agent_name` at the start of any paragraph
/// (paragraphs are separated by a blank line), matched case-insensitively.
pub fn mentions_at_paragraph_start(content: &str, agent_name: &str) -> bool {
    content
        .split("\n\n")
        .any(|paragraph| paragraph_starts_with_mention(paragraph, agent_name))
}

fn paragraph_starts_with_mention(paragraph: &str, agent_name: &str) -> bool {
    let trimmed = paragraph.trim_start();
    let Some(rest) = trimmed.strip_prefix('@') else {
        return false;
    };
    let name_len = agent_name.chars().count();
    let candidate: String = rest.chars().take(name_len).collect();
    if !candidate.eq_ignore_ascii_case(agent_name) {
        return false;
    }
    match rest.chars().nth(name_len) {
        None => true,
        Some(c) => !c.is_alphanumeric() && c != '_',
    }
}

/// True if `content` looks like a turn-limit notification, matched against
/// the fixed prefix every notification carries.
pub fn is_turn_limit_notification(content: &str) -> bool {
    content.trim_start().starts_with("Turn limit reached (")
}

/// Strips every `@agent_name` occurrence from the agent's own response
/// before persistence, so an agent never appears to mention itself.
pub fn strip_self_mentions(response: &str, agent_name: &str) -> String {
    let pattern = format!("@{agent_name}");
    let mut out = String::with_capacity(response.len());
    let mut rest = response;
    loop {
        match find_case_insensitive(rest, &pattern) {
            Some(idx) => {
                out.push_str(&rest[..idx]);
                rest = &rest[idx + pattern.len()..];
            }
            None => {
                out.push_str(rest);
                break;
            }
        }
    }
    out.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn find_case_insensitive(haystack: &str, needle: &str) -> Option<usize> {
    let haystack_lower = haystack.to_lowercase();
    let needle_lower = needle.to_lowercase();
    haystack_lower.find(&needle_lower)
}

/// If the agent's response contains no `@` mention at all but was prompted
/// by another agent mentioning it, prepends `@<original_sender>` so the
/// conversation thread stays addressable.
pub fn ensure_mention_if_prompted_by_agent(response: &str, original_sender: &str, original_sender_is_agent: bool) -> String {
    if original_sender_is_agent && !response.contains('@') {
        format!("@{original_sender} {response}")
    } else {
        response.to_string()
    }
}

pub fn turn_limit_message(agent_name: &str, turn_limit: u32) -> String {
    format!("Turn limit reached ({turn_limit} LLM calls) for @{agent_name}. @human")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matches_mention_at_start_of_first_paragraph() {
        assert!(mentions_at_paragraph_start("@Echo can you help?", "Echo"));
    }

    #[test]
    fn matches_mention_case_insensitively() {
        assert!(mentions_at_paragraph_start("@ECHO look at this", "Echo"));
    }

    #[test]
    fn ignores_mention_mid_paragraph() {
        assert!(!mentions_at_paragraph_start("hey @Echo can you help?", "Echo"));
    }

    #[test]
    fn matches_mention_in_second_paragraph() {
        assert!(mentions_at_paragraph_start("intro text\n\n@Echo are you there?", "Echo"));
    }

    #[test]
    fn rejects_prefix_collision() {
        assert!(!mentions_at_paragraph_start("@Echoes of the past", "Echo"));
    }

    #[test]
    fn recognizes_turn_limit_prefix() {
        assert!(is_turn_limit_notification("Turn limit reached (5 LLM calls) for @Echo. @human"));
        assert!(!is_turn_limit_notification("just a normal message"));
    }

    #[test]
    fn strips_self_mention_and_collapses_whitespace() {
        assert_eq!(strip_self_mentions("@Echo I agree with @Echo here", "Echo"), "I agree with here");
    }

    #[test]
    fn prepends_mention_only_when_missing_and_prompted_by_agent() {
        assert_eq!(ensure_mention_if_prompted_by_agent("sounds good", "Echo", true), "@Echo sounds good");
        assert_eq!(ensure_mention_if_prompted_by_agent("@Echo sounds good", "Echo", true), "@Echo sounds good");
        assert_eq!(ensure_mention_if_prompted_by_agent("sounds good", "human", false), "sounds good");
    }
}
