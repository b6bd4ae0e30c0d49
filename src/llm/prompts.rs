use crate::job::Tone;

/// System instruction for translating one chunk of a longer document.
pub fn translation_system_prompt(target_language: &str, tone: Tone) -> String {
    let register = match tone {
        Tone::Formal => "Use a formal register appropriate for professional or literary prose.",
        Tone::Informal => "Use an informal, conversational register.",
        Tone::Neutral => "Use a neutral register, neither stiff nor casual.",
    };

    format!(
        "You are a professional translator working through a long document one passage at a time.\n\
         Translate the passage you are given into the language with tag \"{target}\".\n\
         {register}\n\
         \n\
         Rules:\n\
         - Translate faithfully; do not summarize, expand, or editorialize\n\
         - Preserve paragraph breaks exactly as they appear in the source\n\
         - Keep proper nouns, numbers, and formatting untouched unless the target language requires otherwise\n\
         - If prior context is provided, use it only to keep terminology and phrasing consistent\n\
         - Output ONLY the translated passage, no preamble and no notes",
        target = target_language,
        register = register,
    )
}

/// User message carrying the optional prior-context block and the chunk
/// source. The context block is the tail of the previous chunk's source,
/// surfaced here rather than inlined into the chunk itself.
pub fn translation_user_prompt(previous_summary: &str, source: &str) -> String {
    if previous_summary.is_empty() {
        format!("passage: ```{}```\n\ntranslation: ", source)
    } else {
        format!(
            "The document so far ended with (context only, do NOT translate):\n```{}```\n\n\
             passage: ```{}```\n\ntranslation: ",
            previous_summary, source
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_prompt_mentions_language_and_tone() {
        let prompt = translation_system_prompt("pt-BR", Tone::Formal);
        assert!(prompt.contains("pt-BR"));
        assert!(prompt.contains("formal register"));
    }

    #[test]
    fn test_user_prompt_without_context() {
        let prompt = translation_user_prompt("", "Hello world.");
        assert!(prompt.contains("Hello world."));
        assert!(!prompt.contains("context only"));
    }

    #[test]
    fn test_user_prompt_with_context() {
        let prompt = translation_user_prompt("the end of last chunk", "Next chunk.");
        assert!(prompt.contains("the end of last chunk"));
        assert!(prompt.contains("Next chunk."));
        assert!(prompt.contains("do NOT translate"));
    }
}
