use std::collections::HashSet;
use std::ffi::OsString;

use hostpty::core::codec::{
    compose_command_line, dedup_environment, environment_block, parse_environment_block,
    split_command_line, EnvCase,
};
use proptest::prelude::*;

fn os_pairs(entries: &[(String, String)]) -> Vec<(OsString, OsString)> {
    entries
        .iter()
        .map(|(k, v)| (OsString::from(k), OsString::from(v)))
        .collect()
}

proptest! {
    #[test]
    fn composed_command_line_splits_back(args in prop::collection::vec("[ -~\t]{0,12}", 1..6)) {
        let line = compose_command_line(&args);
        prop_assert_eq!(split_command_line(&line), args);
    }

    #[test]
    fn dedup_keeps_one_entry_per_key_with_last_value(
        entries in prop::collection::vec(("[A-Za-z_]{1,3}", "[a-z0-9/]{0,4}"), 0..24)
    ) {
        let out = dedup_environment(os_pairs(&entries), EnvCase::Insensitive);

        let mut seen = HashSet::new();
        for (key, value) in &out {
            let key = key.to_string_lossy();
            prop_assert!(seen.insert(key.to_uppercase()), "duplicate key {}", key);

            let last = entries
                .iter()
                .rev()
                .find(|(k, _)| k.eq_ignore_ascii_case(&key));
            prop_assert!(last.is_some());
            if let Some((last_key, last_value)) = last {
                prop_assert_eq!(last_key.as_str(), &*key);
                prop_assert_eq!(last_value.as_str(), &*value.to_string_lossy());
            }
        }

        let distinct: HashSet<_> = entries.iter().map(|(k, _)| k.to_uppercase()).collect();
        prop_assert_eq!(seen.len(), distinct.len());
    }

    #[test]
    fn environment_block_parses_back(
        entries in prop::collection::vec(("[A-Z][A-Z0-9_]{0,6}", "[ -~]{0,8}"), 0..10)
    ) {
        let entries = dedup_environment(os_pairs(&entries), EnvCase::Sensitive);
        let block = environment_block(&entries);
        prop_assert_eq!(&block[block.len() - 2..], &[0u16, 0][..]);
        prop_assert_eq!(parse_environment_block(&block), entries);
    }
}

#[test]
fn case_differing_path_keeps_last() {
    let entries = vec![
        (OsString::from("PATH"), OsString::from("/a")),
        (OsString::from("path"), OsString::from("/b")),
    ];
    let out = dedup_environment(entries, EnvCase::Insensitive);
    assert_eq!(out, vec![(OsString::from("path"), OsString::from("/b"))]);
}

#[test]
fn spaced_and_quoted_arguments_survive() {
    let args = ["hello world", "say \"hi\""];
    let line = compose_command_line(args);
    assert_eq!(line, r#""hello world" "say \"hi\"""#);
    assert_eq!(split_command_line(&line), args);
}
