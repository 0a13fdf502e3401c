//! Template substitution.
//!
//! By contract this is a literal single-pass substring scan, not a
//! template engine: prompt text routinely contains braces and newline
//! sequences that must pass through byte-for-byte. Replaced values are
//! never re-scanned.
//!
//! Recognized tokens: `{{.Body}}`, `{{.PrePrompt}}`,
//! `{{.PreviousResponse}}`, `{{.FanResults}}`, and `{{.Step.<name>}}`
//! (an undefined step name substitutes empty). Anything else is left
//! untouched.

use crate::context::FlowContext;

/// Render a step template against the execution context.
pub fn render(template: &str, ctx: &FlowContext) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find("{{.") {
        out.push_str(&rest[..start]);
        let tail = &rest[start..];

        let Some(end) = tail.find("}}") else {
            // Unterminated token: everything from here on is literal.
            out.push_str(tail);
            return out;
        };

        let token = &tail[3..end];
        match resolve(token, ctx) {
            Some(value) => out.push_str(value),
            None => out.push_str(&tail[..end + 2]),
        }
        rest = &tail[end + 2..];
    }

    out.push_str(rest);
    out
}

fn resolve<'a>(token: &str, ctx: &'a FlowContext) -> Option<&'a str> {
    match token {
        "Body" => Some(ctx.body.as_str()),
        "PrePrompt" => Some(ctx.pre_prompt.as_str()),
        "PreviousResponse" => Some(ctx.previous_response.as_str()),
        "FanResults" => Some(ctx.fan_results.as_str()),
        _ => token
            .strip_prefix("Step.")
            .map(|name| ctx.step_output(name).unwrap_or("")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> FlowContext {
        let mut ctx = FlowContext::new("Claim X", "be thorough");
        ctx.record_step("decompose", "three sub-claims");
        ctx.set_fan_results(r#"{"a":"X"}"#.to_string());
        ctx
    }

    #[test]
    fn test_basic_tokens() {
        let rendered = render("{{.PrePrompt}}: analyze {{.Body}}", &ctx());
        assert_eq!(rendered, "be thorough: analyze Claim X");
    }

    #[test]
    fn test_previous_response_and_step_output() {
        let rendered = render("prev={{.PreviousResponse}} s={{.Step.decompose}}", &ctx());
        assert_eq!(rendered, "prev=three sub-claims s=three sub-claims");
    }

    #[test]
    fn test_undefined_step_substitutes_empty() {
        assert_eq!(render("[{{.Step.missing}}]", &ctx()), "[]");
    }

    #[test]
    fn test_fan_results_token() {
        assert_eq!(render("{{.FanResults}}", &ctx()), r#"{"a":"X"}"#);
    }

    #[test]
    fn test_unrecognized_tokens_pass_through() {
        let template = "keep {{.Unknown}} and {json: {nested}} and {{plain}}";
        assert_eq!(render(template, &ctx()), template);
    }

    #[test]
    fn test_unterminated_token_is_literal() {
        assert_eq!(render("broken {{.Body", &ctx()), "broken {{.Body");
    }

    #[test]
    fn test_replacement_is_not_rescanned() {
        let mut ctx = FlowContext::new("{{.PrePrompt}}", "secret");
        ctx.record_step("x", "y");
        // The body's own token text must land verbatim, not expand.
        assert_eq!(render("{{.Body}}", &ctx), "{{.PrePrompt}}");
    }

    #[test]
    fn test_rendering_is_deterministic() {
        let template = "{{.Step.decompose}} / {{.Body}} / {{.Step.decompose}}";
        let first = render(template, &ctx());
        let second = render(template, &ctx());
        assert_eq!(first, second);
        assert_eq!(first, "three sub-claims / Claim X / three sub-claims");
    }
}
