//! 从模型回复中提取 JSON 片段（```json ... ``` 代码块或首个 { 到最后一个 }）

pub fn extract_json_block(output: &str) -> Option<&str> {
    let trimmed = output.trim();
    if let Some(start) = trimmed.find("```json") {
        let rest = &trimmed[start + 7..];
        return Some(rest.find("```").map(|end| rest[..end].trim()).unwrap_or(rest.trim()));
    }
    let start = trimmed.find('{')?;
    let end = trimmed.rfind('}')?;
    (end > start).then(|| &trimmed[start..=end])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fenced_block() {
        let out = "Sure:\n```json\n{\"a\": 1}\n```\nthanks";
        assert_eq!(extract_json_block(out), Some("{\"a\": 1}"));
    }

    #[test]
    fn test_bare_object() {
        assert_eq!(extract_json_block("x {\"a\": {\"b\": 2}} y"), Some("{\"a\": {\"b\": 2}}"));
    }

    #[test]
    fn test_no_json() {
        assert_eq!(extract_json_block("plain text"), None);
        assert_eq!(extract_json_block("} {"), None);
    }
}
