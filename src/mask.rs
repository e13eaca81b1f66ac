//! PII masking collaborator.
//!
//! Applied to extracted text before it is used for retrieval when the
//! access policy flags a path for masking. The regex-based default
//! covers the common Korean/English identifiers; anything heavier is an
//! external collaborator behind the same trait.

use regex::Regex;

pub trait PiiMasker: Send + Sync {
    fn mask(&self, text: &str) -> String;
}

/// Regex-based masker: resident registration numbers, phone numbers,
/// email addresses, and card-like digit groups.
pub struct RegexMasker {
    rrn: Regex,
    phone: Regex,
    email: Regex,
    card: Regex,
}

impl RegexMasker {
    pub fn new() -> Self {
        Self {
            // Korean resident registration number: 6 digits, dash, 7 digits.
            rrn: Regex::new(r"\b\d{6}-\d{7}\b").expect("static regex"),
            phone: Regex::new(r"\b01[016789]-?\d{3,4}-?\d{4}\b").expect("static regex"),
            email: Regex::new(r"[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}").expect("static regex"),
            card: Regex::new(r"\b\d{4}-\d{4}-\d{4}-\d{4}\b").expect("static regex"),
        }
    }
}

impl Default for RegexMasker {
    fn default() -> Self {
        Self::new()
    }
}

impl PiiMasker for RegexMasker {
    fn mask(&self, text: &str) -> String {
        let text = self.rrn.replace_all(text, "[주민번호]");
        let text = self.card.replace_all(&text, "[카드번호]");
        let text = self.phone.replace_all(&text, "[전화번호]");
        let text = self.email.replace_all(&text, "[이메일]");
        text.into_owned()
    }
}

/// No-op masker for rows whose policy does not request masking.
pub struct NoopMasker;

impl PiiMasker for NoopMasker {
    fn mask(&self, text: &str) -> String {
        text.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn masks_common_identifiers() {
        let masker = RegexMasker::new();
        let out = masker.mask(
            "담당자 연락처 010-1234-5678, 주민번호 900101-1234567, 메일 kim@example.co.kr",
        );
        assert!(!out.contains("900101-1234567"));
        assert!(!out.contains("010-1234-5678"));
        assert!(!out.contains("kim@example.co.kr"));
        assert!(out.contains("[주민번호]"));
        assert!(out.contains("[전화번호]"));
        assert!(out.contains("[이메일]"));
    }

    #[test]
    fn leaves_plain_text_alone() {
        let masker = RegexMasker::new();
        let text = "회의는 2024-08-01 오전 10시";
        assert_eq!(masker.mask(text), text);
    }
}
