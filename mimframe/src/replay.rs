use {
    crate::prelude::*,
    lib_record::{read_entries, split_entry, type_code, Tag},
    std::{
        collections::HashMap,
        fs::File,
        io::BufReader,
        path::Path,
        sync::atomic::{AtomicUsize, Ordering},
    },
};

/// The replay index: an insertion-ordered map from question entries to their
/// recorded response groups. Built once at startup; after that the per-entry
/// choose counters are the only mutable state
pub struct ReplayIndex {
    entries: Vec<(String, ResponseHandler)>,
    by_key: HashMap<String, usize>,
    items: Vec<String>,
}

/// Handles multiple replies to the same question: each repeat of an identical
/// `<-` entry in the transcript opens a fresh response group
struct ResponseHandler {
    groups: Vec<Vec<String>>,
    times_chosen: AtomicUsize,
}

impl ReplayIndex {
    pub fn load(file: Option<&Path>, items: Vec<String>) -> CrateResult<Self> {
        let blocks = match file {
            Some(path) => read_entries(BufReader::new(File::open(path)?))?,
            None => Vec::new(),
        };
        Ok(Self::build(blocks, items))
    }

    fn build(blocks: Vec<String>, items: Vec<String>) -> Self {
        let mut entries: Vec<(String, Vec<Vec<String>>)> = Vec::new();
        let mut by_key: HashMap<String, usize> = HashMap::new();
        let mut current = None;

        for block in blocks {
            if block.starts_with("<-") {
                let key = block.trim().to_string();
                match by_key.get(&key) {
                    Some(&index) => {
                        entries[index].1.push(Vec::new());
                        current = Some(index);
                    }
                    None => {
                        by_key.insert(key.clone(), entries.len());
                        entries.push((key, vec![Vec::new()]));
                        current = Some(entries.len() - 1);
                    }
                }
            } else if let Some(index) = current {
                // groups always hold at least one list once their key exists
                if let Some(group) = entries[index].1.last_mut() {
                    group.push(block);
                }
            }
        }

        let entries = entries
            .into_iter()
            .map(|(key, groups)| {
                (
                    key,
                    ResponseHandler {
                        groups,
                        times_chosen: AtomicUsize::new(0),
                    },
                )
            })
            .collect();

        Self {
            entries,
            by_key,
            items,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn items(&self) -> &[String] {
        &self.items
    }

    /// Pure replay: a transcript is loaded and no item list narrows it down
    pub fn is_active_for_all(&self) -> bool {
        !self.is_empty() && self.items.is_empty()
    }

    /// Returns the recorded response entries matching the given question, as
    /// (tag, body) pairs, advancing the chosen handler's counter. An exact
    /// key match is preferred; failing that the question may fuzzy-match a
    /// key of the same type, unless it is enquiry-only
    pub fn responses_for(
        &self,
        desc: &str,
        has_info: bool,
        enquiry_only: bool,
    ) -> Vec<(Tag, String)> {
        if !has_info {
            return Vec::new();
        }
        match self.response_map_key(desc, enquiry_only) {
            Some(index) => self.entries[index].1.make_responses(),
            None => Vec::new(),
        }
    }

    fn response_map_key(&self, desc: &str, enquiry_only: bool) -> Option<usize> {
        debug!("Trying to match '{}'", desc);
        if let Some(&index) = self.by_key.get(desc) {
            debug!("Found exact match");
            Some(index)
        } else if enquiry_only {
            None
        } else {
            self.find_best_match(desc)
        }
    }

    fn find_best_match(&self, desc: &str) -> Option<usize> {
        let target = words(desc);
        let mut best = None;
        let mut best_info = MatchInfo {
            words: Vec::new(),
            unmatched: 100_000,
        };

        for (index, (key, handler)) in self.entries.iter().enumerate() {
            if !same_type(desc, key) {
                continue;
            }
            debug!("Comparing with '{}'", key);
            let info = MatchInfo {
                words: words(key),
                unmatched: handler.unmatched_group_count(),
            };
            if is_better_match(&info, &best_info, &target) {
                best_info = info;
                best = Some(index);
            }
        }

        if let Some(index) = best {
            debug!("Best match chosen as '{}'", self.entries[index].0);
        }
        best
    }
}

impl ResponseHandler {
    fn make_responses(&self) -> Vec<(Tag, String)> {
        let chosen = self.times_chosen.fetch_add(1, Ordering::SeqCst);
        // Past the last group we start over from the first
        let group = if chosen < self.groups.len() {
            &self.groups[chosen]
        } else {
            &self.groups[0]
        };

        group
            .iter()
            .filter_map(|entry| {
                let (_, tag, body) = split_entry(entry)?;
                match tag {
                    Tag::Fil
                    | Tag::Cli
                    | Tag::Srv
                    | Tag::Out
                    | Tag::Err
                    | Tag::Exc
                    | Tag::Ret => Some((tag, body.to_string())),
                    _ => None,
                }
            })
            .collect()
    }

    fn unmatched_group_count(&self) -> isize {
        self.groups.len() as isize - self.times_chosen.load(Ordering::SeqCst) as isize
    }
}

fn same_type(desc1: &str, desc2: &str) -> bool {
    match (type_code(desc1), type_code(desc2)) {
        (Some(one), Some(two)) => one == two,
        _ => false,
    }
}

/// Heuristic word split used for inexact matching: recursive split on each
/// separator in turn, whitespace last
fn words(desc: &str) -> Vec<String> {
    const SEPARATORS: [Option<char>; 5] = [Some('/'), Some('('), Some(')'), Some('\\'), None];
    split_words(desc, &SEPARATORS)
}

fn split_words(desc: &str, separators: &[Option<char>]) -> Vec<String> {
    match separators.split_first() {
        None => vec![desc.to_string()],
        Some((Some(sep), rest)) => desc
            .split(*sep)
            .flat_map(|part| split_words(part, rest))
            .collect(),
        // Whitespace runs swallow empty tokens, unlike the char separators
        Some((None, _)) => desc.split_whitespace().map(String::from).collect(),
    }
}

struct MatchInfo {
    words: Vec<String>,
    unmatched: isize,
}

/// Ranking between two candidate keys, judged against the incoming question's
/// word list. More common words wins, then fewer non-matching gap runs, then
/// more response groups still unconsumed
fn is_better_match(candidate: &MatchInfo, best: &MatchInfo, target: &[String]) -> bool {
    let blocks1 = matching_blocks(&candidate.words, target);
    let blocks2 = matching_blocks(&best.words, target);

    let common1 = common_element_count(&blocks1);
    let common2 = common_element_count(&blocks2);
    debug!("Words in common {} vs {}", common1, common2);
    if common1 != common2 {
        return common1 > common2;
    }

    let gaps1 = non_matching_sequence_count(&blocks1);
    let gaps2 = non_matching_sequence_count(&blocks2);
    debug!("Non matching sequences {} vs {}", gaps1, gaps2);
    if gaps1 != gaps2 {
        return gaps1 < gaps2;
    }

    debug!(
        "Unmatched count difference {} vs {}",
        candidate.unmatched, best.unmatched
    );
    candidate.unmatched > best.unmatched
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct Block {
    a: usize,
    b: usize,
    size: usize,
}

fn common_element_count(blocks: &[Block]) -> usize {
    blocks.iter().map(|block| block.size).sum()
}

fn non_matching_sequence_count(blocks: &[Block]) -> usize {
    // The gap in front of the terminating sentinel is discounted when the
    // final real block touches the end of both word lists
    if blocks.len() > 1 && last_block_reaches_end(blocks) {
        blocks.len() - 2
    } else {
        blocks.len() - 1
    }
}

fn last_block_reaches_end(blocks: &[Block]) -> bool {
    let penultimate = blocks[blocks.len() - 2];
    let last = blocks[blocks.len() - 1];
    penultimate.a + penultimate.size == last.a && penultimate.b + penultimate.size == last.b
}

/// Longest-common-subsequence matching blocks over two word lists, ending
/// with a zero-size sentinel at (len, len)
fn matching_blocks(a: &[String], b: &[String]) -> Vec<Block> {
    let mut b2j: HashMap<&str, Vec<usize>> = HashMap::new();
    for (j, word) in b.iter().enumerate() {
        b2j.entry(word).or_default().push(j);
    }

    let mut queue = vec![(0, a.len(), 0, b.len())];
    let mut blocks = Vec::new();
    while let Some((alo, ahi, blo, bhi)) = queue.pop() {
        let found = longest_match(a, &b2j, alo, ahi, blo, bhi);
        if found.size > 0 {
            if alo < found.a && blo < found.b {
                queue.push((alo, found.a, blo, found.b));
            }
            if found.a + found.size < ahi && found.b + found.size < bhi {
                queue.push((found.a + found.size, ahi, found.b + found.size, bhi));
            }
            blocks.push(found);
        }
    }
    blocks.sort_by_key(|block| (block.a, block.b));

    let mut merged: Vec<Block> = Vec::new();
    for block in blocks {
        match merged.last_mut() {
            Some(last) if last.a + last.size == block.a && last.b + last.size == block.b => {
                last.size += block.size
            }
            _ => merged.push(block),
        }
    }
    merged.push(Block {
        a: a.len(),
        b: b.len(),
        size: 0,
    });
    merged
}

fn longest_match(
    a: &[String],
    b2j: &HashMap<&str, Vec<usize>>,
    alo: usize,
    ahi: usize,
    blo: usize,
    bhi: usize,
) -> Block {
    let (mut besti, mut bestj, mut bestsize) = (alo, blo, 0);
    let mut j2len: HashMap<usize, usize> = HashMap::new();

    for i in alo..ahi {
        let mut newj2len = HashMap::new();
        if let Some(indices) = b2j.get(a[i].as_str()) {
            for &j in indices {
                if j < blo {
                    continue;
                }
                if j >= bhi {
                    break;
                }
                let run = if j == 0 {
                    1
                } else {
                    j2len.get(&(j - 1)).copied().unwrap_or(0) + 1
                };
                newj2len.insert(j, run);
                if run > bestsize {
                    besti = i + 1 - run;
                    bestj = j + 1 - run;
                    bestsize = run;
                }
            }
        }
        j2len = newj2len;
    }

    Block {
        a: besti,
        b: bestj,
        size: bestsize,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lib_record::read_entries;

    fn index(transcript: &str, items: &[&str]) -> ReplayIndex {
        ReplayIndex::build(
            read_entries(transcript.as_bytes()).unwrap(),
            items.iter().map(|s| s.to_string()).collect(),
        )
    }

    #[test]
    fn word_split_is_recursive() {
        assert_eq!(
            words(r"<-CMD:cp /tmp/a.txt (backup)"),
            vec!["<-CMD:cp", "tmp", "a.txt", "backup"]
        );
    }

    #[test]
    fn exact_match_wins() {
        let replay = index(
            "<-CMD:ls\n->OUT:a\nb\n->ERR:\n->EXC:0\n",
            &[],
        );
        let responses = replay.responses_for("<-CMD:ls", true, false);
        assert_eq!(
            responses,
            vec![
                (Tag::Out, "a\nb\n".to_string()),
                (Tag::Err, "\n".to_string()),
                (Tag::Exc, "0\n".to_string()),
            ]
        );
    }

    #[test]
    fn fuzzy_match_picks_the_closest_key_of_the_same_type() {
        let replay = index(
            "<-CMD:grep foo a.txt\n->OUT:match\n->EXC:0\n<-CMD:wc -l a.txt\n->OUT:3\n",
            &[],
        );
        let responses = replay.responses_for("<-CMD:grep foo b.txt", true, false);
        assert_eq!(responses[0], (Tag::Out, "match\n".to_string()));
    }

    #[test]
    fn fuzzy_match_never_crosses_types() {
        let replay = index("<-CLI:grep foo a.txt\n->SRV:reply\n", &[]);
        assert!(replay
            .responses_for("<-CMD:grep foo a.txt", true, false)
            .is_empty());
    }

    #[test]
    fn enquiry_only_questions_do_not_fuzzy_match() {
        let replay = index("<-PYT:config.cache_dir\n->RET:'/tmp'\n", &[]);
        assert!(replay
            .responses_for("<-PYT:config.other_dir", true, true)
            .is_empty());
        // but the exact key still matches
        assert_eq!(
            replay.responses_for("<-PYT:config.cache_dir", true, true),
            vec![(Tag::Ret, "'/tmp'\n".to_string())]
        );
    }

    #[test]
    fn repeated_questions_cycle_through_their_groups() {
        let replay = index(
            "<-CMD:date\n->OUT:monday\n<-CMD:date\n->OUT:tuesday\n",
            &[],
        );
        let first = replay.responses_for("<-CMD:date", true, false);
        let second = replay.responses_for("<-CMD:date", true, false);
        let third = replay.responses_for("<-CMD:date", true, false);

        assert_eq!(first, vec![(Tag::Out, "monday\n".to_string())]);
        assert_eq!(second, vec![(Tag::Out, "tuesday\n".to_string())]);
        // past the last group the first is reused
        assert_eq!(third, first);
    }

    #[test]
    fn unknown_response_tags_are_skipped() {
        let replay = index("<-CMD:ls\n->XYZ:gone\n->OUT:kept\n", &[]);
        assert_eq!(
            replay.responses_for("<-CMD:ls", true, false),
            vec![(Tag::Out, "kept\n".to_string())]
        );
    }

    #[test]
    fn no_info_questions_are_never_replayed() {
        let replay = index("<-CMD:ls\n->OUT:a\n", &[]);
        assert!(replay.responses_for("<-CMD:ls", false, false).is_empty());
    }

    #[test]
    fn matching_blocks_merge_and_carry_a_sentinel() {
        let a: Vec<String> = ["x", "y", "z"].iter().map(|s| s.to_string()).collect();
        let b: Vec<String> = ["x", "y", "q"].iter().map(|s| s.to_string()).collect();
        let blocks = matching_blocks(&a, &b);
        assert_eq!(
            blocks,
            vec![
                Block { a: 0, b: 0, size: 2 },
                Block { a: 3, b: 3, size: 0 },
            ]
        );
        assert_eq!(common_element_count(&blocks), 2);
        assert_eq!(non_matching_sequence_count(&blocks), 1);
    }
}
