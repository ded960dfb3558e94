//! Stage prompt assembly.
//!
//! A [`ComposedPrompt`] is a typed document: a preamble carrying the
//! isolation declaration, a list of tagged sections, and stage directives.
//! Plot-bearing sections can only be built from [`PlotSource`] (or from the
//! outline derived from it); reference material goes into its own tags.

use crate::core::error::CompositionError;
use crate::core::state::{BatchIndex, EpisodeRange, Mode, Outline, Stage};
use crate::services::context::{leading_slice, trailing_slice, ContextWindow};
use crate::services::isolator::{HistoryContext, IsolatedInputs, LayoutReference, PlotSource, StyleReference};
use log::debug;
use std::borrow::Cow;
use std::ops::RangeInclusive;

pub const TARGET_EPISODES: RangeInclusive<u32> = 60..=80;
pub const OUTLINE_PROSE_CHARS: RangeInclusive<usize> = 2000..=3000;

pub const TAG_SOURCE: &str = "ORIGINAL_NOVEL";
pub const TAG_OUTLINE: &str = "STORY_OUTLINE";
pub const TAG_HISTORY: &str = "PREVIOUS_CONTEXT";
pub const TAG_STYLE: &str = "STYLE_REFERENCE";
pub const TAG_LAYOUT: &str = "LAYOUT_TEMPLATE";

const RESERVED_TAGS: [&str; 5] = [TAG_SOURCE, TAG_OUTLINE, TAG_HISTORY, TAG_STYLE, TAG_LAYOUT];

pub fn default_banned_phrases() -> Vec<String> {
    vec!["很快".to_string(), "转眼间".to_string(), "于是".to_string()]
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SectionKind {
    PlotSource,
    Outline,
    Style,
    Layout,
    History,
}

impl SectionKind {
    pub fn carries_plot(&self) -> bool {
        matches!(self, SectionKind::PlotSource | SectionKind::Outline)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TaggedSection {
    pub kind: SectionKind,
    pub tag: &'static str,
    body: String,
}

impl TaggedSection {
    fn plot(source: &PlotSource, max_chars: usize) -> Self {
        Self::new(SectionKind::PlotSource, TAG_SOURCE, leading_slice(source.as_str(), max_chars))
    }

    fn outline(outline: &Outline) -> Self {
        Self::new(SectionKind::Outline, TAG_OUTLINE, &outline.raw)
    }

    fn style(style: &StyleReference) -> Self {
        Self::new(SectionKind::Style, TAG_STYLE, style.as_str())
    }

    fn layout(layout: &LayoutReference) -> Self {
        Self::new(SectionKind::Layout, TAG_LAYOUT, layout.as_str())
    }

    fn history(history: &HistoryContext, max_chars: usize) -> Self {
        let body = if history.is_empty_history() {
            history.as_str()
        } else {
            trailing_slice(history.as_str(), max_chars)
        };
        Self::new(SectionKind::History, TAG_HISTORY, body)
    }

    fn new(kind: SectionKind, tag: &'static str, body: &str) -> Self {
        let escaped = escape_reserved_tags(body);
        if let Cow::Owned(_) = escaped {
            debug!("Escaped reserved delimiter inside <{}> content", tag);
        }
        Self {
            kind,
            tag,
            body: escaped.into_owned(),
        }
    }

    pub fn body(&self) -> &str {
        &self.body
    }

    fn render(&self) -> String {
        format!("<{tag}>\n{body}\n</{tag}>", tag = self.tag, body = self.body)
    }
}

/// Rewrites literal reserved tags in embedded content to full-width brackets
/// so they cannot close or open a section.
pub fn escape_reserved_tags(body: &str) -> Cow<'_, str> {
    let collides = RESERVED_TAGS
        .iter()
        .any(|tag| body.contains(&format!("<{}>", tag)) || body.contains(&format!("</{}>", tag)));
    if !collides {
        return Cow::Borrowed(body);
    }

    let mut escaped = body.to_string();
    for tag in RESERVED_TAGS {
        escaped = escaped
            .replace(&format!("</{}>", tag), &format!("＜/{}＞", tag))
            .replace(&format!("<{}>", tag), &format!("＜{}＞", tag));
    }
    Cow::Owned(escaped)
}

#[derive(Debug, Clone)]
pub struct ComposedPrompt {
    pub stage: Stage,
    pub episodes: Option<EpisodeRange>,
    preamble: String,
    sections: Vec<TaggedSection>,
    directives: String,
}

impl ComposedPrompt {
    pub fn sections(&self) -> &[TaggedSection] {
        &self.sections
    }

    pub fn section(&self, kind: SectionKind) -> Option<&TaggedSection> {
        self.sections.iter().find(|s| s.kind == kind)
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        out.push_str(self.preamble.trim_end());
        out.push_str("\n\n");
        for section in &self.sections {
            out.push_str(&section.render());
            out.push_str("\n\n");
        }
        out.push_str(self.directives.trim_end());
        out.push('\n');
        out
    }
}

#[derive(Debug, Clone)]
pub struct PromptComposer {
    window: ContextWindow,
    banned_phrases: Vec<String>,
}

impl Default for PromptComposer {
    fn default() -> Self {
        Self::new(ContextWindow::default(), default_banned_phrases())
    }
}

impl PromptComposer {
    pub fn new(window: ContextWindow, banned_phrases: Vec<String>) -> Self {
        Self {
            window,
            banned_phrases,
        }
    }

    pub fn window(&self) -> &ContextWindow {
        &self.window
    }

    pub fn compose_outline(&self, inputs: &IsolatedInputs) -> Result<ComposedPrompt, CompositionError> {
        let source = TaggedSection::plot(&inputs.source, self.window.outline_source_chars);
        if source.body.trim().is_empty() {
            return Err(CompositionError::EmptySource);
        }

        let preamble = format!(
            "你现在是一名专业的漫剧总编剧。你的任务是基于【原著小说内容】创作深度大纲。\n\
            \n\
            【输入指令 - 优先级声明】：\n\
            1. <{src}> 标签内是【唯一剧情来源】。严禁从其他标签中提取任何人物、背景或事件。\n\
            2. <{style}> 标签内仅用于【词汇与语气参考】。\n\
            3. <{layout}> 标签内仅用于【排版符号参考】。",
            src = TAG_SOURCE,
            style = TAG_STYLE,
            layout = TAG_LAYOUT,
        );

        let directives = format!(
            "【核心任务 - 阶段化规划】：\n\
            在生成 {pmin}-{pmax} 字大纲之前，必须首先输出一份【剧本进度路线图】，确保 {emin}-{emax} 集的体量。\n\
            格式要求：\n\
            ---\n\
            【剧本进度路线图】\n\
            第 1-10 集：[阶段标题] | 原著对应章节：[第X章-第Y章] | 核心剧情钩子：...\n\
            第 11-20 集：[阶段标题] | 原著对应章节：[第Y+1章-第Z章] | 核心剧情钩子：...\n\
            （依此类推，覆盖 {emin}-{emax} 集全篇）\n\
            ---\n\
            \n\
            【大纲创作要求】：\n\
            - 逻辑溯源：确保大纲中的每一个冲突都直接源自 <{src}>。\n\
            - 节奏控制：大纲内容必须详尽，尤其是前中期的铺垫，禁止直接写结局，要为 {emin}-{emax} 集预留足够的冲突空间。\n\
            - 视觉克隆：如果 <{layout}> 中使用了特殊的括号（如【】）或分段标记，请在输出中原样复刻。\n\
            - 输出目标：先输出《剧本进度路线图》，再输出 {pmin}-{pmax} 字的深度大纲。\n\
            \n\
            请开始分析并生成。",
            pmin = OUTLINE_PROSE_CHARS.start(),
            pmax = OUTLINE_PROSE_CHARS.end(),
            emin = TARGET_EPISODES.start(),
            emax = TARGET_EPISODES.end(),
            src = TAG_SOURCE,
            layout = TAG_LAYOUT,
        );

        Ok(ComposedPrompt {
            stage: Stage::Outline,
            episodes: None,
            preamble,
            sections: vec![
                source,
                TaggedSection::style(&inputs.style),
                TaggedSection::layout(&inputs.layout),
            ],
            directives,
        })
    }

    pub fn compose_segment(
        &self,
        batch_index: u32,
        mode: Mode,
        inputs: &IsolatedInputs,
        outline: &Outline,
    ) -> Result<ComposedPrompt, CompositionError> {
        let batch = BatchIndex::new(batch_index)?;
        let source = TaggedSection::plot(&inputs.source, self.window.segment_source_chars);
        if source.body.trim().is_empty() {
            return Err(CompositionError::EmptySource);
        }

        let range = batch.episode_range();
        let (start, end) = (range.start, range.end);

        let stage_anchor = match outline.stage_for(range) {
            Some(stage) => format!("（当前对应阶段：{}）", stage.describe()),
            None => String::new(),
        };

        let preamble = format!(
            "任务：编写动漫脚本 第 {start} - {end} 集。\n\
            频道：{channel}\n\
            {audience}\n\
            \n\
            【当前执行进度与关联约束】：\n\
            1. 阶段定位：请从 <{outline}> 的【剧本进度路线图】中找到涵盖第 {start}-{end} 集的阶段。{stage_anchor}\n\
            2. 进度锁死：你现在的任务是极度细腻地展开该阶段对应的剧情。严禁提及或推进后续阶段的任何情节。\n\
            3. 扩容系数：为了保证 {emin}-{emax} 集的体量，大纲中的一个细微剧情点（哪怕一句话），你必须扩充为至少 3-5 场完整的戏。\n\
            \n\
            【输入隔离与职责】：\n\
            - <{src}>：唯一剧情来源，提供本集的核心细节。\n\
            - <{outline}>：包含全局路线图和剧情框架，源自原著。\n\
            - <{history}>：仅提供上下文衔接状态。\n\
            - <{style}>：仅用于文笔参考，严禁从中提取情节。\n\
            - <{layout}>：仅用于格式参考，严禁从中提取情节。",
            channel = mode.channel_label(),
            audience = audience_directive(mode),
            emin = TARGET_EPISODES.start(),
            emax = TARGET_EPISODES.end(),
            src = TAG_SOURCE,
            outline = TAG_OUTLINE,
            history = TAG_HISTORY,
            style = TAG_STYLE,
            layout = TAG_LAYOUT,
        );

        let continuity = if inputs.history.is_empty_history() {
            format!("2. 开篇起笔：这是第一批脚本，第 {start} 集从原著开端自然起笔。")
        } else {
            format!(
                "2. 上下文锚定：分析 <{history}> 的最后一句，第 {start} 集的第一句必须无缝承接，不得出现叙事断层。",
                history = TAG_HISTORY,
            )
        };

        let banned = if self.banned_phrases.is_empty() {
            String::new()
        } else {
            format!(
                "禁止使用{}等总结性过渡词汇。",
                self.banned_phrases
                    .iter()
                    .map(|p| format!("“{}”", p))
                    .collect::<Vec<_>>()
                    .join("、")
            )
        };

        let directives = format!(
            "【脚本生成准则】：\n\
            1. 慢节奏叙事：{banned}必须写出具体的环境压抑感、角色的眼神交流、台词间的拉扯。\n\
            {continuity}\n\
            3. 去AI痕迹：多用动词和神态描写，不要写类似“他意识到自己应该...”这种心理说明，要写出他具体的动作。\n\
            \n\
            输出中文纯文本脚本。"
        );

        Ok(ComposedPrompt {
            stage: Stage::Segment,
            episodes: Some(range),
            preamble,
            sections: vec![
                source,
                TaggedSection::outline(outline),
                TaggedSection::history(&inputs.history, self.window.history_chars),
                TaggedSection::style(&inputs.style),
                TaggedSection::layout(&inputs.layout),
            ],
            directives,
        })
    }
}

fn audience_directive(mode: Mode) -> &'static str {
    match mode {
        Mode::Male => "受众侧重：突出成长爽点、力量对抗与权谋博弈的张力，剧情事实仍以原著为准。",
        Mode::Female => "受众侧重：突出情感拉扯、人物关系与细腻情绪的外化表现，剧情事实仍以原著为准。",
    }
}
