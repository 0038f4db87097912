//! Topic matching helpers for MQTT wildcard subscriptions (`+`, `#`).

/// Does a subscribed `filter` (possibly containing `+`/`#` wildcards) match
/// a concrete delivered `topic`? Follows the standard MQTT matching rules:
/// `+` matches exactly one level, `#` matches all remaining levels and is
/// only valid as the final segment.
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let filter_parts: Vec<&str> = filter.split('/').collect();
    let topic_parts: Vec<&str> = topic.split('/').collect();

    let mut fi = 0;
    let mut ti = 0;

    while fi < filter_parts.len() {
        match filter_parts[fi] {
            "#" => return true, // matches everything remaining, must be last
            "+" => {
                if ti >= topic_parts.len() {
                    return false;
                }
            }
            literal => {
                if ti >= topic_parts.len() || topic_parts[ti] != literal {
                    return false;
                }
            }
        }
        fi += 1;
        ti += 1;
    }

    ti == topic_parts.len()
}

/// Find the first watcher whose subscribed topic matches the delivered
/// topic. Ties (two watchers subscribed to overlapping filters) resolve to
/// declaration order, matching "per topic order" processing elsewhere.
pub fn find_matching_watcher<'a>(
    topics: impl IntoIterator<Item = (&'a str, &'a str)>,
    delivered_topic: &str,
) -> Option<&'a str> {
    topics
        .into_iter()
        .find(|(_, filter)| topic_matches(filter, delivered_topic))
        .map(|(id, _)| id)
}

// ===========================================================================
// Tests
// ===========================================================================
