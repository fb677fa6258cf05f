//! Gateway slash commands, answered inline without spawning a child.

/// A recognized gateway command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SlashCommand {
    /// `/models` — list the configured model choices.
    ListModels,
    /// `/model <name>` — switch the session to `name`.
    SetModel(String),
}

/// Parse submitted content as a slash command. Anything else returns `None`
/// and goes to the provider.
pub fn parse(content: &str) -> Option<SlashCommand> {
    let trimmed = content.trim();
    if trimmed == "/models" {
        return Some(SlashCommand::ListModels);
    }
    if let Some(rest) = trimmed.strip_prefix("/model ") {
        let name = rest.trim();
        if !name.is_empty() {
            return Some(SlashCommand::SetModel(name.to_string()));
        }
    }
    None
}

/// Render the `/models` reply text.
pub fn models_reply(choices: &[String], current: Option<&str>) -> String {
    if choices.is_empty() {
        return "No models configured.".to_string();
    }
    let mut out = String::from("Available models:\n");
    for choice in choices {
        if Some(choice.as_str()) == current {
            out.push_str(&format!("* {choice} (current)\n"));
        } else {
            out.push_str(&format!("* {choice}\n"));
        }
    }
    out.push_str("\nSwitch with /model <name>.");
    out
}

/// Render the `/model <name>` confirmation text.
pub fn set_model_reply(name: &str) -> String {
    format!("Model set to {name}.")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_models() {
        assert_eq!(parse("/models"), Some(SlashCommand::ListModels));
        assert_eq!(parse("  /models  "), Some(SlashCommand::ListModels));
    }

    #[test]
    fn test_parse_set_model() {
        assert_eq!(
            parse("/model o3"),
            Some(SlashCommand::SetModel("o3".to_string()))
        );
        assert_eq!(
            parse("/model  gpt-4o "),
            Some(SlashCommand::SetModel("gpt-4o".to_string()))
        );
    }

    #[test]
    fn test_parse_rejects_others() {
        assert_eq!(parse("/model"), None);
        assert_eq!(parse("/model "), None);
        assert_eq!(parse("/modelsx"), None);
        assert_eq!(parse("hello /models"), None);
        assert_eq!(parse("plain message"), None);
    }

    #[test]
    fn test_models_reply_marks_current() {
        let choices = vec!["o3".to_string(), "gpt-4o".to_string()];
        let reply = models_reply(&choices, Some("gpt-4o"));
        assert!(reply.contains("* o3\n"));
        assert!(reply.contains("* gpt-4o (current)"));
    }

    #[test]
    fn test_models_reply_empty() {
        assert_eq!(models_reply(&[], None), "No models configured.");
    }
}
