use relaycore::ExecutionContext;

/// Resolve `{{path}}` placeholders against the execution context.
/// Unresolvable paths render as empty strings; stray braces pass through.
pub fn render(template: &str, ctx: &ExecutionContext) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find("}}") {
            Some(end) => {
                let path = after[..end].trim();
                if let Some(value) = ctx.get(path) {
                    out.push_str(&value.render());
                }
                rest = &after[end + 2..];
            }
            None => {
                out.push_str(&rest[start..]);
                return out;
            }
        }
    }
    out.push_str(rest);
    out
}
