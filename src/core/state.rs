use crate::core::error::{CompositionError, SequenceError};
use crate::services::context::trailing_slice;
use serde::{Deserialize, Serialize};
use std::fmt;

pub const EPISODES_PER_BATCH: u32 = 3;

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Stage {
    Outline,
    Segment,
}

/// Audience channel for a run. Chosen once; shapes instructions and
/// sampling, never plot.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Male,
    Female,
}

impl Mode {
    pub fn channel_label(&self) -> &'static str {
        match self {
            Mode::Male => "男频",
            Mode::Female => "女频",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Male => write!(f, "male ({})", self.channel_label()),
            Mode::Female => write!(f, "female ({})", self.channel_label()),
        }
    }
}

/// Inclusive episode range.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct EpisodeRange {
    pub start: u32,
    pub end: u32,
}

impl EpisodeRange {
    pub fn contains(&self, episode: u32) -> bool {
        self.start <= episode && episode <= self.end
    }

    pub fn len(&self) -> u32 {
        self.end - self.start + 1
    }
}

impl fmt::Display for EpisodeRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start, self.end)
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(try_from = "u32", into = "u32")]
pub struct BatchIndex(u32);

impl BatchIndex {
    pub const FIRST: BatchIndex = BatchIndex(1);
    /// Largest index whose last episode still fits in a `u32`.
    pub const MAX: BatchIndex = BatchIndex(u32::MAX / EPISODES_PER_BATCH);

    pub fn new(index: u32) -> Result<Self, CompositionError> {
        if index == 0 || index > Self::MAX.0 {
            return Err(CompositionError::InvalidBatchIndex(index));
        }
        Ok(Self(index))
    }

    pub fn get(&self) -> u32 {
        self.0
    }

    /// Saturates at `MAX`; a run closes once `MAX` is generated.
    pub fn next(&self) -> Self {
        Self((self.0 + 1).min(Self::MAX.0))
    }

    /// `[(k-1)*3+1, k*3]`
    pub fn episode_range(&self) -> EpisodeRange {
        EpisodeRange {
            start: (self.0 - 1) * EPISODES_PER_BATCH + 1,
            end: self.0 * EPISODES_PER_BATCH,
        }
    }

    /// Number of batches needed to cover episodes `1..=episodes`.
    pub fn count_for_episodes(episodes: u32) -> u32 {
        episodes.div_ceil(EPISODES_PER_BATCH)
    }
}

impl TryFrom<u32> for BatchIndex {
    type Error = CompositionError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<BatchIndex> for u32 {
    fn from(value: BatchIndex) -> Self {
        value.0
    }
}

impl fmt::Display for BatchIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// --- Outline ---

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct RoadmapStage {
    pub episodes: EpisodeRange,
    pub title: String,
    pub chapters: String,
    pub hook: String,
}

impl RoadmapStage {
    pub fn describe(&self) -> String {
        format!(
            "第 {} 集：{} | 原著对应章节：{} | 核心剧情钩子：{}",
            self.episodes, self.title, self.chapters, self.hook
        )
    }
}

/// Generated once per run. The roadmap is parsed on a best-effort basis;
/// `raw` always holds the full generated text.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Outline {
    pub raw: String,
    pub roadmap: Vec<RoadmapStage>,
    pub prose: String,
}

impl Outline {
    /// Only the first contiguous block of stage lines is the roadmap; blank
    /// lines may separate stages, anything else ends the block. Episode-range
    /// headings further down belong to the prose.
    pub fn from_text(raw: &str) -> Self {
        let lines: Vec<&str> = raw.lines().collect();
        let Some(first) = lines.iter().position(|l| parse_stage_line(l).is_some()) else {
            return Self {
                raw: raw.to_string(),
                roadmap: Vec::new(),
                prose: raw.trim().to_string(),
            };
        };

        let mut roadmap = Vec::new();
        let mut block_end = first;
        for (i, line) in lines.iter().enumerate().skip(first) {
            if let Some(stage) = parse_stage_line(line) {
                roadmap.push(stage);
                block_end = i + 1;
            } else if !line.trim().is_empty() {
                break;
            }
        }

        let prose = lines[block_end..]
            .iter()
            .skip_while(|l| is_roadmap_filler(l))
            .copied()
            .collect::<Vec<_>>()
            .join("\n")
            .trim()
            .to_string();

        Self {
            raw: raw.to_string(),
            roadmap,
            prose,
        }
    }

    pub fn episode_count(&self) -> u32 {
        self.roadmap.iter().map(|s| s.episodes.end).max().unwrap_or(0)
    }

    pub fn prose_chars(&self) -> usize {
        self.prose.chars().count()
    }

    /// Stage whose range holds the first episode of `range`.
    pub fn stage_for(&self, range: EpisodeRange) -> Option<&RoadmapStage> {
        self.roadmap.iter().find(|s| s.episodes.contains(range.start))
    }

    pub fn stages_are_consecutive(&self) -> bool {
        let mut expected = 1;
        for stage in &self.roadmap {
            if stage.episodes.start != expected {
                return false;
            }
            expected = stage.episodes.end + 1;
        }
        !self.roadmap.is_empty()
    }
}

fn parse_stage_line(line: &str) -> Option<RoadmapStage> {
    let line = line.trim().trim_start_matches(['-', '*', '>', ' ']).trim();
    let rest = line.strip_prefix('第')?;
    let (range, rest) = rest.split_once('集')?;
    let (start, end) = range.split_once(['-', '–', '—', '~', '至'])?;
    let start: u32 = start.trim().parse().ok()?;
    let end: u32 = end.trim().parse().ok()?;
    if start == 0 || end < start {
        return None;
    }

    let rest = rest.trim_start_matches([':', '：', ' ']);
    let mut parts = rest.split('|').map(str::trim);
    let title = strip_brackets(parts.next().unwrap_or_default());
    let mut chapters = String::new();
    let mut hook = String::new();
    for part in parts {
        if let Some(v) = strip_label(part, "原著对应章节") {
            chapters = strip_brackets(v);
        } else if let Some(v) = strip_label(part, "核心剧情钩子") {
            hook = v.to_string();
        }
    }

    Some(RoadmapStage {
        episodes: EpisodeRange { start, end },
        title,
        chapters,
        hook,
    })
}

fn strip_label<'a>(part: &'a str, label: &str) -> Option<&'a str> {
    part.strip_prefix(label)
        .map(|v| v.trim_start_matches([':', '：']).trim())
}

fn strip_brackets(s: &str) -> String {
    s.trim().trim_matches(['[', ']', '【', '】']).trim().to_string()
}

fn is_roadmap_filler(line: &str) -> bool {
    let t = line.trim();
    t.is_empty() || t.chars().all(|c| c == '-') || t.starts_with('（') || t.starts_with('(')
}

// --- Script history ---

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct BatchScript {
    pub batch: BatchIndex,
    pub text: String,
}

/// Append-only log of batch outputs, in generation order.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(try_from = "Vec<BatchScript>", into = "Vec<BatchScript>")]
pub struct ScriptHistory {
    batches: Vec<BatchScript>,
}

impl ScriptHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuilds a history from stored entries, which must be batches
    /// `1..=n` in order.
    pub fn from_batches(batches: Vec<BatchScript>) -> Result<Self, SequenceError> {
        for (position, entry) in batches.iter().enumerate() {
            if entry.batch.get() as usize != position + 1 {
                return Err(SequenceError::CorruptHistory {
                    position,
                    found: entry.batch.get(),
                });
            }
        }
        Ok(Self { batches })
    }

    pub fn len(&self) -> usize {
        self.batches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.batches.is_empty()
    }

    pub fn batches(&self) -> &[BatchScript] {
        &self.batches
    }

    pub fn last_batch(&self) -> Option<BatchIndex> {
        self.batches.last().map(|b| b.batch)
    }

    pub fn char_len(&self) -> usize {
        self.batches.iter().map(|b| b.text.chars().count()).sum()
    }

    pub fn concatenated(&self) -> String {
        self.batches.iter().map(|b| b.text.as_str()).collect()
    }

    /// Trailing `max_chars` characters of the concatenated history, built
    /// from only as many recent entries as needed.
    pub fn tail(&self, max_chars: usize) -> String {
        let mut pieces = Vec::new();
        let mut taken = 0;
        for entry in self.batches.iter().rev() {
            if taken >= max_chars {
                break;
            }
            taken += entry.text.chars().count();
            pieces.push(entry.text.as_str());
        }
        pieces.reverse();
        let joined: String = pieces.concat();
        trailing_slice(&joined, max_chars).to_string()
    }

    pub(crate) fn append(&mut self, text: String) -> BatchIndex {
        let batch = match self.last_batch() {
            Some(last) => last.next(),
            None => BatchIndex::FIRST,
        };
        self.batches.push(BatchScript { batch, text });
        batch
    }
}

impl TryFrom<Vec<BatchScript>> for ScriptHistory {
    type Error = SequenceError;

    fn try_from(value: Vec<BatchScript>) -> Result<Self, Self::Error> {
        Self::from_batches(value)
    }
}

impl From<ScriptHistory> for Vec<BatchScript> {
    fn from(value: ScriptHistory) -> Self {
        value.batches
    }
}

/// Persisted progress of one run, kept under the build folder.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct RunState {
    pub mode: Mode,
    #[serde(default)]
    pub outline: Option<Outline>,
    #[serde(default)]
    pub history: ScriptHistory,
    #[serde(default)]
    pub completed: bool,
}

impl RunState {
    pub fn new(mode: Mode) -> Self {
        Self {
            mode,
            outline: None,
            history: ScriptHistory::new(),
            completed: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_OUTLINE: &str = "【剧本进度路线图】
---
第 1-10 集：[寒门初起] | 原著对应章节：[第1章-第5章] | 核心剧情钩子：退婚当日觉醒血脉
第 11-20 集：【宗门试炼】 | 原著对应章节：第6章-第12章 | 核心剧情钩子：试炼中被师兄陷害
第21-30集：[暗流涌动] | 原著对应章节：[第13章-第20章] | 核心剧情钩子：身世之谜初现
---

深度大纲正文第一段。
第二段。";

    #[test]
    fn test_episode_ranges_partition_into_triples() {
        let one = BatchIndex::new(1).unwrap().episode_range();
        assert_eq!((one.start, one.end), (1, 3));
        let five = BatchIndex::new(5).unwrap().episode_range();
        assert_eq!((five.start, five.end), (13, 15));

        let mut expected_start = 1;
        for k in 1..=40 {
            let range = BatchIndex::new(k).unwrap().episode_range();
            assert_eq!(range.start, expected_start);
            assert_eq!(range.len(), EPISODES_PER_BATCH);
            expected_start = range.end + 1;
        }
    }

    #[test]
    fn test_zero_batch_index_is_rejected() {
        assert_eq!(BatchIndex::new(0).unwrap_err(), CompositionError::InvalidBatchIndex(0));
        assert!(serde_json::from_str::<BatchIndex>("0").is_err());
        assert_eq!(serde_json::from_str::<BatchIndex>("4").unwrap().get(), 4);
    }

    #[test]
    fn test_batch_index_beyond_episode_space_is_rejected() {
        let last = BatchIndex::new(u32::MAX / 3).unwrap();
        assert_eq!(last, BatchIndex::MAX);
        assert_eq!(last.episode_range().end, u32::MAX / 3 * 3);
        assert_eq!(last.next(), BatchIndex::MAX);

        assert_eq!(
            BatchIndex::new(u32::MAX / 3 + 1).unwrap_err(),
            CompositionError::InvalidBatchIndex(u32::MAX / 3 + 1)
        );
        assert!(BatchIndex::new(u32::MAX).is_err());
        assert!(serde_json::from_str::<BatchIndex>(&u32::MAX.to_string()).is_err());
    }

    #[test]
    fn test_batch_count_for_episodes() {
        assert_eq!(BatchIndex::count_for_episodes(60), 20);
        assert_eq!(BatchIndex::count_for_episodes(70), 24);
        assert_eq!(BatchIndex::count_for_episodes(80), 27);
    }

    #[test]
    fn test_outline_parses_roadmap_and_prose() {
        let outline = Outline::from_text(SAMPLE_OUTLINE);
        assert_eq!(outline.roadmap.len(), 3);
        assert_eq!(outline.roadmap[0].title, "寒门初起");
        assert_eq!(outline.roadmap[0].chapters, "第1章-第5章");
        assert_eq!(outline.roadmap[0].hook, "退婚当日觉醒血脉");
        assert_eq!(outline.roadmap[1].title, "宗门试炼");
        assert_eq!(outline.roadmap[2].episodes, EpisodeRange { start: 21, end: 30 });
        assert_eq!(outline.episode_count(), 30);
        assert!(outline.stages_are_consecutive());
        assert_eq!(outline.prose, "深度大纲正文第一段。\n第二段。");
    }

    #[test]
    fn test_episode_headings_in_prose_stay_in_prose() {
        let raw = "【剧本进度路线图】
第 1-10 集：[开局] | 原著对应章节：[第1章-第3章] | 核心剧情钩子：退婚
第 11-20 集：[试炼] | 原著对应章节：[第4章-第8章] | 核心剧情钩子：陷害
---

【深度大纲】
第 1-10 集：少年在退婚宴上受辱，当夜血脉觉醒。
第 11-20 集：宗门试炼中被师兄设计，坠入禁地。";
        let outline = Outline::from_text(raw);
        assert_eq!(outline.roadmap.len(), 2);
        assert!(outline.stages_are_consecutive());
        assert_eq!(outline.episode_count(), 20);
        assert!(outline.prose.starts_with("【深度大纲】"));
        assert!(outline.prose.contains("第 11-20 集：宗门试炼中被师兄设计"));
    }

    #[test]
    fn test_roadmap_stages_may_be_separated_by_blank_lines() {
        let outline = Outline::from_text("第 1-10 集：甲\n\n第 11-20 集：乙\n\n正文开始。\n第 21-30 集：正文里的小标题");
        assert_eq!(outline.roadmap.len(), 2);
        assert_eq!(outline.prose, "正文开始。\n第 21-30 集：正文里的小标题");
    }

    #[test]
    fn test_outline_stage_lookup() {
        let outline = Outline::from_text(SAMPLE_OUTLINE);
        let stage = outline.stage_for(BatchIndex::new(4).unwrap().episode_range()).unwrap();
        assert_eq!(stage.title, "寒门初起");
        let stage = outline.stage_for(BatchIndex::new(5).unwrap().episode_range()).unwrap();
        assert_eq!(stage.title, "宗门试炼");
        assert!(outline.stage_for(BatchIndex::new(11).unwrap().episode_range()).is_none());
    }

    #[test]
    fn test_outline_without_roadmap_keeps_text_as_prose() {
        let outline = Outline::from_text("  只有正文。  ");
        assert!(outline.roadmap.is_empty());
        assert_eq!(outline.episode_count(), 0);
        assert!(!outline.stages_are_consecutive());
        assert_eq!(outline.prose, "只有正文。");
    }

    #[test]
    fn test_gapped_roadmap_is_not_consecutive() {
        let outline = Outline::from_text("第 1-10 集：甲\n第 12-20 集：乙");
        assert_eq!(outline.roadmap.len(), 2);
        assert!(!outline.stages_are_consecutive());
    }

    #[test]
    fn test_history_appends_in_order() {
        let mut history = ScriptHistory::new();
        assert_eq!(history.append("第一批。".to_string()).get(), 1);
        assert_eq!(history.append("第二批。".to_string()).get(), 2);
        assert_eq!(history.len(), 2);
        assert_eq!(history.char_len(), 8);
        assert_eq!(history.concatenated(), "第一批。第二批。");
        assert_eq!(history.last_batch().unwrap().get(), 2);
    }

    #[test]
    fn test_history_tail_spans_entries() {
        let mut history = ScriptHistory::new();
        history.append("abcdef".to_string());
        history.append("gh".to_string());
        history.append("ij".to_string());
        assert_eq!(history.tail(3), "hij");
        assert_eq!(history.tail(6), "efghij");
        assert_eq!(history.tail(100), "abcdefghij");
        assert_eq!(history.tail(0), "");
        assert_eq!(history.tail(5), trailing_slice(&history.concatenated(), 5));
    }

    #[test]
    fn test_history_rejects_gaps_on_load() {
        let json = r#"[{"batch":1,"text":"a"},{"batch":3,"text":"c"}]"#;
        let err = serde_json::from_str::<ScriptHistory>(json).unwrap_err();
        assert!(err.to_string().contains("corrupt"));

        let json = r#"[{"batch":1,"text":"a"},{"batch":2,"text":"b"}]"#;
        let history: ScriptHistory = serde_json::from_str(json).unwrap();
        assert_eq!(history.concatenated(), "ab");
    }

    #[test]
    fn test_run_state_round_trips_through_json() {
        let mut state = RunState::new(Mode::Female);
        state.outline = Some(Outline::from_text(SAMPLE_OUTLINE));
        state.history.append("x".to_string());
        let json = serde_json::to_string(&state).unwrap();
        assert!(json.contains("\"female\""));
        let back: RunState = serde_json::from_str(&json).unwrap();
        assert_eq!(back.history, state.history);
        assert_eq!(back.outline, state.outline);
    }
}
