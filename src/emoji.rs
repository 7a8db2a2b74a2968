//! Bidirectional emoji shortcode translation.
//!
//! Slack names reactions with its own shortcodes (`smile`); the other
//! platforms all use the Unicode-ish rendering. The table is loaded from the
//! `emoji:` list in the configuration, one `"slackCode,otherCode"` pair per
//! entry.

use crate::model::Source;

const PAIR_LEN: usize = 2;

/// Translation table between the Slack dialect (column 0) and the shared
/// Unicode dialect (column 1).
#[derive(Debug, Default)]
pub struct EmojiTable {
    pairs: Vec<[String; PAIR_LEN]>,
}

impl EmojiTable {
    /// Build the table from configured `"slackCode,otherCode"` entries.
    /// Malformed entries are skipped.
    pub fn from_pairs<I, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut pairs = Vec::new();
        for entry in entries {
            let mut split = entry.as_ref().splitn(PAIR_LEN, ',');
            match (split.next(), split.next()) {
                (Some(slack), Some(other)) => {
                    pairs.push([slack.trim().to_string(), other.trim().to_string()]);
                }
                _ => {
                    tracing::warn!(entry = %entry.as_ref(), "skipping malformed emoji pair");
                }
            }
        }
        tracing::debug!(count = pairs.len(), "emoji table loaded");
        Self { pairs }
    }

    /// Translate `code` from `source`'s dialect into `target`'s dialect.
    ///
    /// Same-platform and non-Slack-to-non-Slack translations are the
    /// identity; codes missing from the table pass through unchanged.
    pub fn convert(&self, source: Source, target: Source, code: &str) -> String {
        if source == target || (source != Source::Slack && target != Source::Slack) {
            return code.to_string();
        }

        let source_col = dialect_column(source);
        let target_col = dialect_column(target);
        for pair in &self.pairs {
            if pair[source_col] == code {
                return pair[target_col].clone();
            }
        }
        code.to_string()
    }

    /// The non-Slack rendering of a Slack shortcode, or empty when unknown.
    /// Used for inline `:shortcode:` substitution in Slack message bodies.
    pub fn slack_convert(&self, code: &str) -> String {
        for pair in &self.pairs {
            if pair[0] == code {
                return pair[1].clone();
            }
        }
        String::new()
    }
}

fn dialect_column(source: Source) -> usize {
    if source == Source::Slack { 0 } else { 1 }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> EmojiTable {
        EmojiTable::from_pairs(["smile,:)", "thumbsup,👍"])
    }

    #[test]
    fn same_platform_is_identity() {
        let t = table();
        for source in [Source::Slack, Source::Discord, Source::Telegram, Source::Matrix] {
            assert_eq!(t.convert(source, source, "smile"), "smile");
        }
    }

    #[test]
    fn non_slack_pairs_share_a_dialect() {
        let t = table();
        assert_eq!(t.convert(Source::Discord, Source::Matrix, ":)"), ":)");
        assert_eq!(t.convert(Source::Telegram, Source::Discord, "👍"), "👍");
    }

    #[test]
    fn known_codes_round_trip() {
        let t = table();
        let out = t.convert(Source::Slack, Source::Discord, "smile");
        assert_eq!(out, ":)");
        assert_eq!(t.convert(Source::Discord, Source::Slack, &out), "smile");
    }

    #[test]
    fn unknown_codes_pass_through() {
        let t = table();
        assert_eq!(t.convert(Source::Slack, Source::Discord, "mystery"), "mystery");
        assert_eq!(t.convert(Source::Matrix, Source::Slack, "🤖"), "🤖");
    }

    #[test]
    fn slack_convert_is_empty_for_unknown() {
        let t = table();
        assert_eq!(t.slack_convert("smile"), ":)");
        assert_eq!(t.slack_convert("mystery"), "");
    }

    #[test]
    fn malformed_pairs_are_skipped() {
        let t = EmojiTable::from_pairs(["justone", "ok,fine"]);
        assert_eq!(t.convert(Source::Slack, Source::Discord, "ok"), "fine");
        assert_eq!(t.convert(Source::Slack, Source::Discord, "justone"), "justone");
    }
}
