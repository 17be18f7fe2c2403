//! Episode selection syntax
//!
//! `"1-5,10,15-20"` style lists as typed on the command line.

use std::collections::BTreeSet;

/// Parse an episode selection against a series of `max_episode` episodes
///
/// Tokens are comma separated: a single number, an inclusive range `a-b`, or
/// `all`. Range bounds are clamped into `1..=max_episode`; single numbers
/// outside it are dropped, as are tokens that do not parse.
pub fn parse_episode_selection(input: &str, max_episode: u32) -> BTreeSet<u32> {
    let mut episodes = BTreeSet::new();
    if max_episode == 0 {
        return episodes;
    }

    for token in input.split(',').map(str::trim) {
        if token.eq_ignore_ascii_case("all") {
            episodes.extend(1..=max_episode);
        } else if let Some((start, end)) = token.split_once('-') {
            let (Ok(start), Ok(end)) = (start.trim().parse::<u32>(), end.trim().parse::<u32>())
            else {
                continue;
            };
            let start = start.clamp(1, max_episode);
            let end = end.clamp(1, max_episode);
            episodes.extend(start..=end);
        } else if let Ok(episode) = token.parse::<u32>() {
            if (1..=max_episode).contains(&episode) {
                episodes.insert(episode);
            }
        }
    }

    episodes
}
