//! System prompt assembly.

const SYSTEM_TEMPLATE_EN: &str = "You are a helpful AI assistant. You have access to various tools to help accomplish tasks.

When you need to use a tool, output a tool call in this format:
<tool_call>
{\"name\": \"tool_name\", \"arguments\": {\"arg1\": \"value1\"}}
</tool_call>

Available tools:
";

const SYSTEM_TEMPLATE_JA: &str = "あなたは役に立つAIアシスタントです。タスクを達成するためにさまざまなツールを利用できます。

ツールを使う必要があるときは、次の形式でツール呼び出しを出力してください:
<tool_call>
{\"name\": \"tool_name\", \"arguments\": {\"arg1\": \"value1\"}}
</tool_call>

利用可能なツール:
";

/// Builds the per-run system prompt: language template, the tool-schema
/// JSON array, an optional Markdown tool summary and an optional
/// user-provided instruction.
pub fn build_system_prompt(
    tools_schema: &str,
    tools_markdown: &str,
    custom_prompt: Option<&str>,
    use_japanese: bool,
) -> String {
    let template = if use_japanese {
        SYSTEM_TEMPLATE_JA
    } else {
        SYSTEM_TEMPLATE_EN
    };
    let mut prompt = String::with_capacity(template.len() + tools_schema.len() + 64);
    prompt.push_str(template);
    prompt.push_str(tools_schema);
    if !tools_markdown.trim().is_empty() {
        prompt.push_str("\n\n");
        prompt.push_str(tools_markdown.trim_end());
    }
    if let Some(custom) = custom_prompt
        && !custom.trim().is_empty()
    {
        prompt.push_str("\n\n");
        prompt.push_str(custom.trim());
    }
    prompt
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn english_template_contains_canonical_form() {
        let prompt = build_system_prompt("[]", "", None, false);
        assert!(prompt.starts_with("You are a helpful AI assistant."));
        assert!(prompt.contains("<tool_call>"));
        assert!(prompt.contains("Available tools:\n[]"));
    }

    #[test]
    fn japanese_template_selected() {
        let prompt = build_system_prompt("[]", "", None, true);
        assert!(prompt.contains("利用可能なツール"));
    }

    #[test]
    fn custom_prompt_is_appended() {
        let prompt = build_system_prompt("[]", "", Some("Always answer in haiku."), false);
        assert!(prompt.ends_with("Always answer in haiku."));
    }
}
