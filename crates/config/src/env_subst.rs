/// Replace `${ENV_VAR}` and `${ENV_VAR:-fallback}` placeholders in raw config text.
///
/// Unresolvable variables without a fallback are left as-is so the parse
/// error (or the literal value) points at the missing variable.
pub fn substitute_env(input: &str) -> String {
    substitute_env_with(input, |name| std::env::var(name).ok())
}

fn substitute_env_with(input: &str, lookup: impl Fn(&str) -> Option<String>) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find('}') else {
            // Unterminated placeholder, keep the tail verbatim.
            out.push_str(&rest[start..]);
            return out;
        };

        let expr = &after[..end];
        let (name, fallback) = match expr.split_once(":-") {
            Some((name, fallback)) => (name, Some(fallback)),
            None => (expr, None),
        };

        match lookup(name).filter(|v| !v.is_empty()) {
            Some(value) if !name.is_empty() => out.push_str(&value),
            _ => match fallback {
                Some(fallback) => out.push_str(fallback),
                None => {
                    out.push_str("${");
                    out.push_str(expr);
                    out.push('}');
                },
            },
        }
        rest = &after[end + 1..];
    }

    out.push_str(rest);
    out
}
