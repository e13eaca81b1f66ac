//! Static synonym and domain hint tables.
//!
//! Built once at engine construction and consulted per query:
//! extension synonyms map free-text keywords ("파워포인트", "slide deck")
//! to canonical extensions; domain keyword hints map document-type terms
//! ("보고서", "report") to likely extension sets; semantic synonyms feed
//! query expansion; and lexical keyword-hint groups raise the lexical
//! weight for queries that are found more reliably by literal keyword
//! match than by embedding similarity.
//!
//! Every keyword is expanded into multiple normalized forms (lowercase
//! raw, token-joined without space, token-joined with space, and each
//! individual token) to tolerate Korean agglutination and English
//! multi-word variance. All lookups match against the form set, never
//! the raw string.

use std::collections::{HashMap, HashSet};

use crate::lexical::tokenize;

/// One lexical keyword-hint group: queries matching any keyword form get
/// `extra_weight` added to the configured lexical weight.
struct KeywordHintGroup {
    name: &'static str,
    extra_weight: f32,
    forms: HashSet<String>,
}

/// Build-once hint tables owned by the engine context.
pub struct HintTables {
    ext_synonyms: HashMap<String, String>,
    domain_hints: HashMap<String, Vec<String>>,
    semantic_synonyms: HashMap<String, Vec<String>>,
    keyword_groups: Vec<KeywordHintGroup>,
}

/// Result of analyzing a query against the hint tables.
#[derive(Debug, Default)]
pub struct QueryHints {
    /// Extensions the user likely wants, from synonyms and domain hints.
    pub desired_exts: HashSet<String>,
    /// Extra lexical weight from matched keyword-hint groups.
    pub lexical_boost: f32,
    /// Query text with semantic synonym expansions appended.
    pub expanded_query: String,
    /// Which hint entries fired, for `match_reasons`.
    pub reasons: Vec<String>,
}

/// Normalized lookup forms for a keyword: lowercase raw, tokens joined
/// without space, tokens joined with a single space, and each token.
pub fn expand_forms(keyword: &str) -> Vec<String> {
    let raw = keyword.trim().to_lowercase();
    let tokens = tokenize(&raw);
    let mut forms = vec![raw.clone()];
    if !tokens.is_empty() {
        forms.push(tokens.join(""));
        forms.push(tokens.join(" "));
        forms.extend(tokens);
    }
    forms.sort();
    forms.dedup();
    forms
}

impl HintTables {
    pub fn new() -> Self {
        let mut tables = Self {
            ext_synonyms: HashMap::new(),
            domain_hints: HashMap::new(),
            semantic_synonyms: HashMap::new(),
            keyword_groups: Vec::new(),
        };
        tables.install_ext_synonyms();
        tables.install_domain_hints();
        tables.install_semantic_synonyms();
        tables.install_keyword_groups();
        tables
    }

    fn add_ext_synonym(&mut self, keyword: &str, ext: &str) {
        for form in expand_forms(keyword) {
            self.ext_synonyms.insert(form, ext.to_string());
        }
    }

    fn add_domain_hint(&mut self, keyword: &str, exts: &[&str]) {
        let exts: Vec<String> = exts.iter().map(|e| e.to_string()).collect();
        for form in expand_forms(keyword) {
            self.domain_hints.insert(form, exts.clone());
        }
    }

    fn add_semantic_synonyms(&mut self, group: &[&str]) {
        for term in group {
            let expansions: Vec<String> = group
                .iter()
                .filter(|t| *t != term)
                .map(|t| t.to_string())
                .collect();
            for form in expand_forms(term) {
                self.semantic_synonyms.insert(form, expansions.clone());
            }
        }
    }

    fn install_ext_synonyms(&mut self) {
        for kw in ["파워포인트", "피피티", "ppt", "slide deck", "슬라이드", "발표자료", "presentation"] {
            self.add_ext_synonym(kw, ".pptx");
        }
        for kw in ["엑셀", "excel", "spreadsheet", "스프레드시트", "xls"] {
            self.add_ext_synonym(kw, ".xlsx");
        }
        for kw in ["워드", "word doc", "doc"] {
            self.add_ext_synonym(kw, ".docx");
        }
        for kw in ["한글문서", "한글 파일", "hwp", "아래아한글"] {
            self.add_ext_synonym(kw, ".hwp");
        }
        for kw in ["pdf", "피디에프"] {
            self.add_ext_synonym(kw, ".pdf");
        }
        for kw in ["텍스트", "text file", "txt", "메모"] {
            self.add_ext_synonym(kw, ".txt");
        }
        for kw in ["마크다운", "markdown", "md"] {
            self.add_ext_synonym(kw, ".md");
        }
    }

    fn install_domain_hints(&mut self) {
        for kw in ["보고서", "report", "리포트"] {
            self.add_domain_hint(kw, &[".pdf", ".docx", ".hwp"]);
        }
        for kw in ["계약서", "contract", "약관"] {
            self.add_domain_hint(kw, &[".pdf", ".hwp", ".docx"]);
        }
        for kw in ["이력서", "resume", "cv", "경력기술서"] {
            self.add_domain_hint(kw, &[".pdf", ".docx", ".hwp"]);
        }
        for kw in ["사업계획서", "business plan", "제안서", "proposal"] {
            self.add_domain_hint(kw, &[".pptx", ".pdf", ".docx"]);
        }
        for kw in ["회의록", "meeting notes", "minutes"] {
            self.add_domain_hint(kw, &[".docx", ".txt", ".md", ".hwp"]);
        }
        for kw in ["매출", "정산", "예산", "budget", "settlement"] {
            self.add_domain_hint(kw, &[".xlsx"]);
        }
        for kw in ["발표", "presentation", "세미나"] {
            self.add_domain_hint(kw, &[".pptx", ".pdf"]);
        }
    }

    fn install_semantic_synonyms(&mut self) {
        self.add_semantic_synonyms(&["ai", "인공지능", "machine learning", "머신러닝"]);
        self.add_semantic_synonyms(&["보고서", "리포트", "report"]);
        self.add_semantic_synonyms(&["계약", "계약서", "contract"]);
        self.add_semantic_synonyms(&["예산", "budget", "재정"]);
        self.add_semantic_synonyms(&["일정", "schedule", "스케줄"]);
        self.add_semantic_synonyms(&["고객", "customer", "client"]);
        self.add_semantic_synonyms(&["매출", "revenue", "sales"]);
    }

    fn install_keyword_groups(&mut self) {
        // Document types found more reliably by literal keyword match
        // than by embedding similarity.
        let groups: [(&str, f32, &[&str]); 3] = [
            (
                "legal",
                0.5,
                &["법률", "법령", "규정", "시행령", "시행규칙", "조례", "판례", "legal", "regulation", "statute", "compliance"],
            ),
            (
                "resume",
                0.65,
                &["이력서", "경력기술서", "자기소개서", "resume", "cv", "curriculum vitae"],
            ),
            (
                "business-plan",
                0.55,
                &["사업계획서", "사업 계획", "투자제안서", "business plan", "pitch deck", "투자계획"],
            ),
        ];
        for (name, weight, keywords) in groups {
            let mut forms = HashSet::new();
            for kw in keywords {
                forms.extend(expand_forms(kw));
            }
            self.keyword_groups.push(KeywordHintGroup {
                name,
                extra_weight: weight,
                forms,
            });
        }
    }

    /// Analyze a raw query against all tables. Matching happens on the
    /// query's own form set so agglutinated Korean and multi-word English
    /// both resolve.
    pub fn analyze(&self, query: &str) -> QueryHints {
        let forms = expand_forms(query);
        let mut hints = QueryHints {
            expanded_query: query.trim().to_string(),
            ..QueryHints::default()
        };

        for form in &forms {
            if let Some(ext) = self.ext_synonyms.get(form) {
                if hints.desired_exts.insert(ext.clone()) {
                    hints.reasons.push(format!("ext-synonym:{}", ext));
                }
            }
            if let Some(exts) = self.domain_hints.get(form) {
                for ext in exts {
                    if hints.desired_exts.insert(ext.clone()) {
                        hints.reasons.push(format!("domain-hint:{}", ext));
                    }
                }
            }
            if let Some(expansions) = self.semantic_synonyms.get(form) {
                for term in expansions {
                    if !hints.expanded_query.contains(term.as_str()) {
                        hints.expanded_query.push(' ');
                        hints.expanded_query.push_str(term);
                    }
                }
            }
        }

        for group in &self.keyword_groups {
            if forms.iter().any(|f| group.forms.contains(f)) {
                hints.lexical_boost += group.extra_weight;
                hints.reasons.push(format!("keyword-hint:{}", group.name));
            }
        }

        hints
    }
}

impl Default for HintTables {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forms_cover_spacing_variants() {
        let forms = expand_forms("Slide Deck");
        assert!(forms.contains(&"slide deck".to_string()));
        assert!(forms.contains(&"slidedeck".to_string()));
        assert!(forms.contains(&"slide".to_string()));
        assert!(forms.contains(&"deck".to_string()));
    }

    #[test]
    fn ext_synonym_resolves_korean_alias() {
        let tables = HintTables::new();
        let hints = tables.analyze("파워포인트 자료");
        assert!(hints.desired_exts.contains(".pptx"));
        assert!(hints.reasons.iter().any(|r| r.starts_with("ext-synonym")));
    }

    #[test]
    fn domain_hint_maps_report_to_document_exts() {
        let tables = HintTables::new();
        let hints = tables.analyze("2024 사업 보고서");
        assert!(hints.desired_exts.contains(".pdf"));
        assert!(hints.desired_exts.contains(".hwp"));
    }

    #[test]
    fn resume_query_boosts_lexical_weight() {
        let tables = HintTables::new();
        let hints = tables.analyze("김철수 이력서");
        assert!((hints.lexical_boost - 0.65).abs() < 1e-6);
        assert!(hints.reasons.contains(&"keyword-hint:resume".to_string()));
    }

    #[test]
    fn legal_and_plan_groups_have_their_weights() {
        let tables = HintTables::new();
        assert!((tables.analyze("관련 법령 찾아줘").lexical_boost - 0.5).abs() < 1e-6);
        assert!((tables.analyze("business plan draft").lexical_boost - 0.55).abs() < 1e-6);
    }

    #[test]
    fn semantic_synonyms_expand_query() {
        let tables = HintTables::new();
        let hints = tables.analyze("ai 문서");
        assert!(hints.expanded_query.contains("인공지능"));
    }

    #[test]
    fn unmatched_query_is_neutral() {
        let tables = HintTables::new();
        let hints = tables.analyze("zzqqy unrelated");
        assert!(hints.desired_exts.is_empty());
        assert_eq!(hints.lexical_boost, 0.0);
    }
}
