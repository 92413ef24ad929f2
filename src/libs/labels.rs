// Prometheus-style label names, so tag labels line up with what the
// cloudwatch exporters produce for the same resources.

/// Converts `text` into a label name. With `snake_case`, camel case boundaries
/// become underscores and the result is lowercased.
///
/// Returns whether the result is a valid label name, alongside the name itself.
pub fn prom_string_tag(text: &str, snake_case: bool) -> (bool, String)
{
    let name = if snake_case { prom_string(text) } else { sanitize(text) };
    let valid = is_valid_label_name(&name);
    (valid, name)
}

fn prom_string(text: &str) -> String
{
    let mut output = String::with_capacity(text.len() + 4);
    let mut previous: Option<char> = None;

    for c in text.chars()
    {
        if c.is_uppercase() && previous.is_some_and(|p| p.is_lowercase() || p.is_ascii_digit())
        {
            output.push('_');
        }
        push_sanitized(&mut output, c.to_lowercase());
        previous = Some(c);
    }

    output
}

fn sanitize(text: &str) -> String
{
    let mut output = String::with_capacity(text.len());
    for c in text.chars()
    {
        push_sanitized(&mut output, std::iter::once(c));
    }
    output
}

fn push_sanitized(output: &mut String, chars: impl Iterator<Item = char>)
{
    for c in chars
    {
        match c
        {
            '%' => output.push_str("_percent"),
            c if c.is_ascii_alphanumeric() || c == '_' => output.push(c),
            _ => output.push('_'),
        }
    }
}

pub fn is_valid_label_name(name: &str) -> bool
{
    let mut chars = name.chars();
    match chars.next()
    {
        Some(first) if first.is_ascii_alphabetic() || first == '_' => chars.all(|c| c.is_ascii_alphanumeric() || c == '_'),
        _ => false,
    }
}

#[test]
fn test_snake_case()
{
    assert_eq!(prom_string_tag("tag_Environment", true), (true, "tag_environment".to_string()));
    assert_eq!(prom_string_tag("tag_CostCenter", true), (true, "tag_cost_center".to_string()));
    assert_eq!(prom_string_tag("tag_aws:cloudformation:stack-name", true), (true, "tag_aws_cloudformation_stack_name".to_string()));
    assert_eq!(prom_string_tag("tag_team.owner", true), (true, "tag_team_owner".to_string()));
    assert_eq!(prom_string_tag("tag_Cpu%", true), (true, "tag_cpu_percent".to_string()));
}

#[test]
fn test_sanitize_keeps_case()
{
    assert_eq!(prom_string_tag("tag_CostCenter", false), (true, "tag_CostCenter".to_string()));
    assert_eq!(prom_string_tag("9lives", false), (false, "9lives".to_string()));
}
