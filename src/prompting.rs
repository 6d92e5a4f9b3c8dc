use minijinja::{context, Environment};

const SYSTEM_PROMPT_TEMPLATE: &str = include_str!("prompts/system_prompt.j2");
const USER_CONTENT_TEMPLATE: &str = include_str!("prompts/user_content.j2");

pub struct SystemPromptContext<'a> {
    pub assistant_name: &'a str,
    pub clinic_name: &'a str,
    pub personality: &'a str,
    pub clinic_facts: &'a str,
    pub language: &'a str,
    pub max_chars: usize,
}

pub struct UserContentContext<'a> {
    pub profile_block: &'a str,
    pub memory_block: &'a str,
    pub knowledge_block: &'a str,
    pub intent: &'a str,
    pub entities_block: &'a str,
    pub patient_message: &'a str,
}

fn render(name: &str, source: &str, ctx: minijinja::Value) -> Option<String> {
    let mut env = Environment::new();
    env.add_template(name, source).ok()?;
    let template = env.get_template(name).ok()?;
    template.render(ctx).ok()
}

pub fn render_system_prompt(ctx: &SystemPromptContext<'_>) -> String {
    render(
        "system_prompt",
        SYSTEM_PROMPT_TEMPLATE,
        context! {
            assistant_name => ctx.assistant_name,
            clinic_name => ctx.clinic_name,
            personality => ctx.personality.trim(),
            clinic_facts => ctx.clinic_facts.trim(),
            language => ctx.language,
            max_chars => ctx.max_chars,
        },
    )
    .unwrap_or_else(|| fallback_system_prompt(ctx))
}

fn fallback_system_prompt(ctx: &SystemPromptContext<'_>) -> String {
    let mut prompt = format!(
        "You are {} for \"{}\".\n\
         Be accurate, concise and kind. Never invent clinic facts; if a fact is not listed, say you do not have it.\n",
        ctx.assistant_name, ctx.clinic_name
    );
    if !ctx.personality.trim().is_empty() {
        prompt.push_str("\nPersonality:\n");
        prompt.push_str(ctx.personality.trim());
        prompt.push('\n');
    }
    if !ctx.clinic_facts.trim().is_empty() {
        prompt.push_str("\nClinic facts:\n");
        prompt.push_str(ctx.clinic_facts.trim());
        prompt.push('\n');
    }
    prompt
}

pub fn render_user_content(ctx: &UserContentContext<'_>) -> String {
    render(
        "user_content",
        USER_CONTENT_TEMPLATE,
        context! {
            profile_block => ctx.profile_block.trim(),
            memory_block => ctx.memory_block.trim(),
            knowledge_block => ctx.knowledge_block.trim(),
            intent => ctx.intent,
            entities_block => ctx.entities_block,
            patient_message => ctx.patient_message.trim(),
        },
    )
    .unwrap_or_else(|| {
        format!(
            "{}\n\n{}\n\nPatient message:\n{}",
            ctx.knowledge_block.trim(),
            ctx.memory_block.trim(),
            ctx.patient_message.trim()
        )
    })
}
