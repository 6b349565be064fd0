/// Replace `${ENV_VAR}` and `${ENV_VAR:-fallback}` placeholders in raw config
/// text.
///
/// Unresolvable variables without a fallback are left as-is so validation can
/// point at them.
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
            // Unterminated placeholder, emit the remainder verbatim.
            out.push_str(&rest[start..]);
            return out;
        };

        let body = &after[..end];
        let (name, fallback) = match body.split_once(":-") {
            Some((name, fallback)) => (name, Some(fallback)),
            None => (body, None),
        };

        match (name.is_empty(), lookup(name), fallback) {
            (false, Some(value), _) => out.push_str(&value),
            (false, None, Some(fallback)) => out.push_str(fallback),
            _ => {
                out.push_str("${");
                out.push_str(body);
                out.push('}');
            },
        }
        rest = &after[end + 1..];
    }

    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use {super::*, rstest::rstest};

    fn lookup(name: &str) -> Option<String> {
        match name {
            "JOBSTORE_DB" => Some("sqlite://prod.db".to_string()),
            _ => None,
        }
    }

    #[rstest]
    #[case("url = \"${JOBSTORE_DB}\"", "url = \"sqlite://prod.db\"")]
    #[case("${MISSING}", "${MISSING}")]
    #[case("${MISSING:-sqlite::memory:}", "sqlite::memory:")]
    #[case("${JOBSTORE_DB:-ignored}", "sqlite://prod.db")]
    #[case("${}", "${}")]
    #[case("broken ${JOBSTORE_DB", "broken ${JOBSTORE_DB")]
    #[case("plain text", "plain text")]
    fn substitution(#[case] input: &str, #[case] expected: &str) {
        assert_eq!(substitute_env_with(input, lookup), expected);
    }
}
