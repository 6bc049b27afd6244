//! Voice-markup documents for the telephony gateway.
//!
//! Every webhook answer is a small XML document of control verbs: say,
//! gather (collect digits), record, hangup. The builder keeps handlers from
//! ever hand-assembling XML, and escaping lives in exactly one place.

/// One control verb in a response document
#[derive(Debug, Clone)]
enum Verb {
    Say {
        text: String,
    },
    Gather {
        num_digits: u32,
        timeout_secs: u32,
        finish_on_key: char,
        action: String,
        prompt: String,
    },
    Record {
        max_length_secs: u32,
        trim_silence: bool,
        action: String,
        status_callback: String,
    },
    Hangup,
}

/// A gateway response document under construction
#[derive(Debug, Clone, Default)]
pub struct VoiceResponse {
    verbs: Vec<Verb>,
}

impl VoiceResponse {
    pub fn new() -> Self {
        Self::default()
    }

    /// Speak a prompt
    pub fn say(mut self, text: impl Into<String>) -> Self {
        self.verbs.push(Verb::Say { text: text.into() });
        self
    }

    /// Collect digits, speaking `prompt` while waiting
    pub fn gather(
        mut self,
        num_digits: u32,
        timeout_secs: u32,
        finish_on_key: char,
        action: impl Into<String>,
        prompt: impl Into<String>,
    ) -> Self {
        self.verbs.push(Verb::Gather {
            num_digits,
            timeout_secs,
            finish_on_key,
            action: action.into(),
            prompt: prompt.into(),
        });
        self
    }

    /// Record the caller, posting completion to `action` and status changes
    /// to `status_callback`
    pub fn record(
        mut self,
        max_length_secs: u32,
        action: impl Into<String>,
        status_callback: impl Into<String>,
    ) -> Self {
        self.verbs.push(Verb::Record {
            max_length_secs,
            trim_silence: true,
            action: action.into(),
            status_callback: status_callback.into(),
        });
        self
    }

    /// End the call
    pub fn hangup(mut self) -> Self {
        self.verbs.push(Verb::Hangup);
        self
    }

    /// Render the document
    pub fn to_xml(&self) -> String {
        let mut out = String::from("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n<Response>");

        for verb in &self.verbs {
            match verb {
                Verb::Say { text } => {
                    out.push_str(&format!("<Say>{}</Say>", xml_escape(text)));
                }
                Verb::Gather {
                    num_digits,
                    timeout_secs,
                    finish_on_key,
                    action,
                    prompt,
                } => {
                    out.push_str(&format!(
                        "<Gather numDigits=\"{}\" timeout=\"{}\" finishOnKey=\"{}\" action=\"{}\"><Say>{}</Say></Gather>",
                        num_digits,
                        timeout_secs,
                        finish_on_key,
                        xml_escape(action),
                        xml_escape(prompt),
                    ));
                }
                Verb::Record {
                    max_length_secs,
                    trim_silence,
                    action,
                    status_callback,
                } => {
                    out.push_str(&format!(
                        "<Record maxLength=\"{}\" trim=\"{}\" playBeep=\"true\" action=\"{}\" statusCallback=\"{}\"/>",
                        max_length_secs,
                        if *trim_silence { "trim-silence" } else { "do-not-trim" },
                        xml_escape(action),
                        xml_escape(status_callback),
                    ));
                }
                Verb::Hangup => out.push_str("<Hangup/>"),
            }
        }

        out.push_str("</Response>");
        out
    }
}

fn xml_escape(raw: &str) -> String {
    let mut escaped = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&apos;"),
            other => escaped.push(other),
        }
    }
    escaped
}
