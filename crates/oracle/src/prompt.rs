//! Renders an [`OracleContext`] into the single prompt the model sees.

use std::fmt::Write;

use droidpilot_core::OracleContext;

const PREAMBLE: &str = "\
You drive an Android device through an automation server that speaks JSON-RPC.
The device has already been selected. Work towards the user's request one call at a time.";

const RULES: &str = r#"Answer with exactly one JSON object and nothing else: no markdown, no code fences, no commentary.

To perform an action, answer with a call:
{"jsonrpc": "2.0", "id": <id>, "method": "tools/call", "params": {"name": "<tool name>", "arguments": {...}}}

When the request has been fully carried out, answer with:
{"status": "completed", "message": "<short summary>"}

Use tool names exactly as listed. Base each step on the replies so far; UI actions can take a moment to take effect."#;

/// Build the prompt for one loop pass.
pub fn render_prompt(context: &OracleContext) -> String {
    let mut prompt = String::with_capacity(
        PREAMBLE.len() + RULES.len() + context.capabilities.len() + context.query.len() + 256,
    );

    prompt.push_str(PREAMBLE);
    prompt.push_str("\n\n## Available tools\n");
    prompt.push_str(context.capabilities.trim());
    prompt.push_str("\n\n## User request\n");
    prompt.push_str(context.query.trim());
    prompt.push_str("\n\n## Previous replies\n");
    if context.transcript.is_empty() {
        prompt.push_str("(none yet)\n");
    } else {
        for (i, reply) in context.transcript.iter().enumerate() {
            let _ = writeln!(prompt, "{}. {}", i + 1, reply.trim());
        }
    }
    let _ = write!(
        prompt,
        "\n## Step\nThis is step {} of {}. Use id {} for your call.\n\n",
        context.iteration, context.max_iterations, context.next_id
    );
    prompt.push_str(RULES);
    prompt
}
