use super::helpers::{indent_lines, print_json};
use anyhow::Result;
use vmh_common::scenario::{StepDefinition, StepRegistry};

pub fn list_steps(json: bool) -> Result<()> {
    let registry = StepRegistry::with_builtin_steps();
    if json {
        let definitions: Vec<&StepDefinition> = registry.definitions().collect();
        return print_json(&definitions);
    }
    for definition in registry.definitions() {
        println!("{}", describe(definition));
    }
    Ok(())
}

fn describe(definition: &StepDefinition) -> String {
    let mut out = format!("{}  {}", definition.verb, definition.summary);
    let params: Vec<String> = definition
        .params
        .iter()
        .map(|p| {
            let marker = if p.required { "" } else { "?" };
            format!("{}{marker}: {}", p.name, p.kind)
        })
        .collect();
    if !params.is_empty() {
        out.push('\n');
        out.push_str(&indent_lines(&params.join("\n"), "    "));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_describe_marks_optional_params() {
        let registry = StepRegistry::with_builtin_steps();
        let text = describe(registry.get("file_exists").unwrap());
        assert!(text.starts_with("file_exists  "));
        assert!(text.contains("    path: string"));
        assert!(text.contains("    timeout?: duration"));
    }
}
