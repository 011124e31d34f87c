use crate::llm::ChatMessage;

const PERSONA: &str = "You are ThreatDesk, a cybersecurity assistant. Answer questions in a warm, \
chatty, and friendly way 😊. Use the provided context to be accurate and helpful. Keep it \
conversational and approachable, with occasional emojis. When asked about yourself, do not \
mention the underlying language model or its vendor; only talk about being ThreatDesk.";

const REASONING_INSTRUCTION: &str = "When generating reasoning (internal thought process), do \
not include instructions about tone, style, or being friendly. Do not include system role \
reminders or emojis. Only reason about the user's query content itself and its logical analysis.";

pub const PLANNING_APOLOGY: &str = "Sorry, I couldn't work out how to look that up right now. \
Could you rephrase the question or try again in a moment?";

/// Leading messages of every conversation history.
pub fn system_messages() -> Vec<ChatMessage> {
    vec![
        ChatMessage::system(PERSONA),
        ChatMessage::system(REASONING_INSTRUCTION),
    ]
}

/// User message carrying tool results ahead of the original query.
pub fn contextual_query(context: &str, query: &str) -> String {
    format!("{context}\n\nUser Query: {query}")
}

/// Asks the model to explain a scan result for a non-expert.
pub fn scan_explanation(result_json: &str, query: &str) -> String {
    format!(
        "You are a friendly cybersecurity advisor. A threat was scanned and produced the following results:

RESULT : {result_json}

Explain these results in a clear, engaging, and friendly way using emojis:
- Start with a cheerful intro (do NOT say \"The numbers mean\").
- Highlight what is safe ✅, suspicious ⚠️, or dangerous ❌.
- Give a concise verdict in plain language.
- Provide 3–5 actionable tips for the user.
- If a check failed, say which one and why in one sentence.
- Make it concise, approachable, and easy to read, like a helpful guide.

Example style:
🚀 Scan Summary:
- ✅ Mostly safe
- ⚠️ Some caution
- ❌ Dangerous

🧐 Why it matters:
...

💡 What you should do:
1. ...
2. ...

This is the query : {query}"
    )
}

/// `role: content` lines of the non-system messages, for title generation.
pub fn transcript(messages: &[ChatMessage]) -> String {
    messages
        .iter()
        .map(|message| format!("{}: {}", message.role.as_str(), message.text()))
        .collect::<Vec<String>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scan_prompt_embeds_result_and_query() {
        let prompt = scan_explanation("{\"malicious\": 3}", "is this safe?");
        assert!(prompt.contains("RESULT : {\"malicious\": 3}"));
        assert!(prompt.ends_with("This is the query : is this safe?"));
    }

    #[test]
    fn transcript_lists_roles() {
        let text = transcript(&[ChatMessage::user("hi"), ChatMessage::assistant("hello")]);
        assert_eq!(text, "user: hi\nassistant: hello");
    }
}
