use serde_json::Value;
use std::io;
use std::path::{Path, PathBuf};
use store::Document;

/// File name prefix of a dumped pull request.
pub fn dump_prefix(org: &str, repository: &str, number: u64) -> String {
    format!("github.com-{}-{}-{}", org, repository, number)
}

/// Write the raw GraphQL reply and the extracted documents of one pull
/// request as pretty-printed JSON into `dir`.
pub fn write_dump(
    dir: &Path,
    prefix: &str,
    raw: &Value,
    extracted: &[Document],
) -> io::Result<(PathBuf, PathBuf)> {
    let raw_path = dir.join(format!("{}_raw.json", prefix));
    let extracted_path = dir.join(format!("{}_extracted.json", prefix));
    std::fs::write(&raw_path, serde_json::to_string_pretty(raw)?)?;
    std::fs::write(&extracted_path, serde_json::to_string_pretty(extracted)?)?;
    Ok((raw_path, extracted_path))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use store::{Event, EventKind};

    #[test]
    fn test_dump_prefix() {
        assert_eq!(
            dump_prefix("morucci", "monocle", 42),
            "github.com-morucci-monocle-42"
        );
    }

    #[test]
    fn test_write_dump() {
        let dir = tempfile::tempdir().unwrap();
        let raw = json!({"data": {"repository": {"pullRequest": {"id": "PR_1"}}}});
        let event: Event = serde_json::from_value(json!({
            "id": "PR_1_created",
            "type": "ChangeCreatedEvent",
            "created_at": "2020-01-01T00:00:00Z",
            "author": "jane",
            "repository_prefix": "morucci",
            "repository_fullname": "morucci/monocle",
            "repository_shortname": "monocle",
            "url": "https://github.com/morucci/monocle/pull/42",
            "change_id": "PR_1",
            "number": 42,
            "on_author": "jane",
            "on_created_at": "2020-01-01T00:00:00Z",
            "branch": "crawler",
            "target_branch": "master"
        }))
        .unwrap();
        assert_eq!(event.kind, EventKind::ChangeCreatedEvent);

        let (raw_path, extracted_path) =
            write_dump(dir.path(), "github.com-morucci-monocle-42", &raw, &[event.into()])
                .unwrap();
        assert!(raw_path.ends_with("github.com-morucci-monocle-42_raw.json"));

        let written: Value =
            serde_json::from_str(&std::fs::read_to_string(raw_path).unwrap()).unwrap();
        assert_eq!(written, raw);
        let extracted: Vec<Value> =
            serde_json::from_str(&std::fs::read_to_string(extracted_path).unwrap()).unwrap();
        assert_eq!(extracted[0]["id"], "PR_1_created");
    }

    #[test]
    fn test_write_dump_missing_dir() {
        assert!(write_dump(Path::new("/nonexistent/dumps"), "x", &json!({}), &[]).is_err());
    }
}
