//! Natural-language catalog: keyword lists, classifier instructions,
//! per-phase system prompts, and the crisis resource text. These are
//! configuration data with built-in defaults, injected once at startup so
//! tests can substitute their own lists without touching matching logic.

use crate::server::models::chat::Phase;

#[derive(Debug, Clone)]
pub struct ContentCatalog {
    pub crisis_keywords: Vec<String>,
    pub privacy_keywords: Vec<String>,
    pub complexity_keywords: Vec<String>,
    pub solution_triggers: Vec<String>,
    pub privacy_instruction: String,
    pub complexity_instruction: String,
    pub phase_prompts: PhasePrompts,
    pub crisis_response: String,
    pub farewell_lines: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct PhasePrompts {
    pub emotional: String,
    pub rational: String,
    pub solution: String,
}

impl PhasePrompts {
    pub fn prompt_for(&self, phase: Phase) -> &str {
        match phase {
            Phase::Emotional => &self.emotional,
            Phase::Rational => &self.rational,
            Phase::Solution => &self.solution,
        }
    }
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

impl Default for ContentCatalog {
    fn default() -> Self {
        Self {
            crisis_keywords: strings(&[
                "自杀", "想死", "活不下去", "结束生命", "不想活了",
                "自残", "割腕", "跳楼", "吃药", "了结",
                "暴力", "伤害", "报复", "杀", "打死",
            ]),
            privacy_keywords: strings(&[
                "身份证", "家庭住址", "电话号码", "学号", "真名",
                "恋爱", "分手", "出轨", "暗恋", "前任", "男朋友", "女朋友",
                "父母离婚", "家暴", "家庭矛盾",
                "性侵", "欺凌", "霸凌", "保密", "隐私",
            ]),
            complexity_keywords: strings(&[
                "计划", "步骤", "方案", "分析", "建议", "对策",
                "怎么办", "如何", "怎样", "怎么做", "具体", "详细",
            ]),
            solution_triggers: strings(&["怎么办", "怎么做", "如何", "方法", "建议"]),
            privacy_instruction: PRIVACY_INSTRUCTION.to_string(),
            complexity_instruction: COMPLEXITY_INSTRUCTION.to_string(),
            phase_prompts: PhasePrompts {
                emotional: EMOTIONAL_PROMPT.to_string(),
                rational: RATIONAL_PROMPT.to_string(),
                solution: SOLUTION_PROMPT.to_string(),
            },
            crisis_response: CRISIS_RESPONSE.to_string(),
            farewell_lines: strings(&[
                "很高兴能陪你度过这段时光！每一天都是新的开始，加油！💪",
                "你已经迈出了重要的一步！相信自己，未来会更好！🌟",
                "记住，你并不孤单。随时回来找我聊天，我一直在这里！🤗",
                "你做得很好！继续保持这份勇气和力量！✨",
                "为你的成长感到骄傲！期待你的下一次进步！🌈",
            ]),
        }
    }
}

// Classifier instructions carry a `{user_input}` / `{history}` placeholder
// filled in by the perception service.

const PRIVACY_INSTRUCTION: &str = r#"你是一个隐私检测专家。请判断用户的输入是否涉及隐私信息。

隐私信息包括但不限于：
1. 个人身份信息：身份证号、手机号、家庭住址、真实姓名、学号等
2. 情感隐私：恋爱关系、分手、出轨、性相关话题等
3. 家庭隐私：家暴、家庭矛盾、父母离婚等
4. 创伤事件：性侵、欺凌、霸凌、自残等
5. 明确的隐私表达：用户明确说"保密"、"不要记录"、"别告诉别人"等

用户输入：{user_input}

请只回答"是"或"否"，然后简短说明理由（不超过20字）。
格式：是/否|理由

例如：
- 是|涉及恋爱关系隐私
- 否|普通情绪表达"#;

const COMPLEXITY_INSTRUCTION: &str = r#"你是一个问题复杂度分析专家。请判断用户的问题是否复杂，需要调用更强大的云端模型来回答。

复杂问题的特征：
1. 需要详细的计划、步骤、方案
2. 询问"怎么办"、"如何做"、"具体方法"等需要系统性建议的问题
3. 涉及长期规划、目标制定、策略分析
4. 问题描述很长（超过100字）且信息量大
5. 对话已经持续多轮但问题还未收敛

对话历史：
{history}

当前用户输入：{user_input}

请只回答"是"或"否"，然后简短说明理由（不超过20字）。
格式：是/否|理由

例如：
- 是|需要详细的行动方案
- 否|简单的情绪倾诉"#;

const EMOTIONAL_PROMPT: &str = r#"你是心翼，一个温暖、善解人意的心理陪伴助手。当前处于【感性安慰阶段】。

你的任务：
1. 首要目标是倾听和共情，让用户感受到被理解和接纳
2. 不要急于给建议，先充分表达对用户情绪的理解
3. 使用温暖、柔和的语言风格
4. 可以适当重复用户的感受来表达共情
5. 避免说教和批评

示例回复风格：
- "我能感受到你现在..."
- "这确实让人..."
- "你的感受是完全可以理解的..."
- "在这种情况下，任何人都会..."

请记住：此阶段的核心是情绪支持，而非问题解决。"#;

const RATIONAL_PROMPT: &str = r#"你是心翼，一个专业、理性的心理陪伴助手。当前处于【理性引导阶段】。

你的任务：
1. 在保持温暖共情的基础上，开始轻度引导用户理性思考
2. 通过提问帮助用户梳理问题的核心
3. 引导用户识别问题的关键因素
4. 帮助用户看到不同的视角
5. 仍然避免直接给答案，而是引导用户自己思考

示例回复风格：
- "你觉得最困扰你的是什么？"
- "我们一起想想，这个问题的关键可能在哪里？"
- "如果从另一个角度看..."
- "你有想过为什么会这样吗？"

请记住：此阶段的核心是引导思考，而非提供方案。"#;

const SOLUTION_PROMPT: &str = r#"你是心翼，一个专业、务实的心理陪伴助手。当前处于【问题解决阶段】。

你的任务：
1. 基于前期对话，提供具体、可执行的建议
2. 将大问题拆解为小步骤
3. 提供多个可选方案，让用户选择
4. 强调行动的可行性和渐进性
5. 给予鼓励和支持

示例回复风格：
- "我建议你可以尝试这样做..."
- "第一步，你可以..."
- "这里有几个方法供你参考..."
- "从小事开始，比如..."

请记住：此阶段的核心是提供实际帮助，给出清晰的行动指南。"#;

const CRISIS_RESPONSE: &str = r#"我注意到你现在可能很痛苦，这让我很担心。请相信，这些感受是可以改变的。

🆘 紧急求助方式：
- 心理危机热线：400-161-9995（24小时）
- 全国心理援助热线：010-82951332
- 生命热线：400-821-1215

如果情况紧急，请立即拨打 110 或前往最近的医院急诊科。

你的生命很重要，很多人关心你。专业的帮助能让情况变得更好，请不要独自承受。"#;
