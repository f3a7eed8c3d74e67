//! Prompt templates for every model call.
//!
//! The extraction prompt is deliberately schema-agnostic: it asks for every
//! readable piece of content under natural field names. Conformance to a
//! caller's labels is left to the conversion prompt.

use serde_json::Value;

use crate::schema::TargetSchema;

/// Bumped whenever the default extraction prompt changes meaningfully
pub const EXTRACTION_PROMPT_VERSION: &str = "extract-v1";

pub const DEFAULT_EXTRACTION_SYSTEM_PROMPT: &str = r#"You are a document extraction engine. You receive an image of one document page and return its content as a single JSON object.

Rules:
1. Extract ALL discernible content: headings, names, addresses, dates, identifiers, amounts, tables, line items, notes, and fine print.
2. Choose natural, semantically descriptive field names for what you see (for example "restaurant", "amount_due", "line_items"). Do not force the content into any predefined schema.
3. Numbers are sacred: copy every digit, decimal, currency symbol and percentage exactly as printed.
4. Represent tables and repeated rows as arrays of objects with consistent keys.
5. Group related values into nested objects where that mirrors the document's structure.
6. Do not invent values. Leave out anything you cannot read.
7. Return ONLY the JSON object. No markdown fences, no commentary."#;

pub const CONSOLIDATION_SYSTEM_PROMPT: &str = r#"You resolve disagreements between per-page extraction results of one multi-page document.

Rules:
1. The pages are merged already except for the CONFLICTING FIELDS, given as dotted paths. Only resolve those.
2. For each conflicting field, choose the value the document as a whole supports (for example the final total on the last summary page).
3. Answer with a JSON object that holds each conflicting field at its original nested path with the chosen value. You may omit every other field.
4. If the other value carries distinct meaning, add it under a descriptive sibling key next to the conflicting field.
5. Keep the field names used in the page results.
6. Return ONLY the JSON object. No markdown fences, no commentary."#;

pub const CONVERSION_SYSTEM_PROMPT: &str = r#"You are a data structure converter. You take data that was extracted from a document and re-express it under a required JSON schema.

Rules:
1. Use ONLY the field names declared in the target schema, at every nesting level.
2. Map each piece of source data to the target field with the same meaning, even when the source used a different name (for example "restaurant" to "merchant", "amount_due" to "total").
3. Follow the declared types exactly: string, number, integer, boolean, arrays and nested objects.
4. Preserve every numerical value exactly. Do not round, recompute, or reformat.
5. Do not invent information. If the source has nothing for a field, set it to null.
6. Return ONLY the JSON object. No markdown fences, no commentary."#;

/// Bumped whenever the Markdown transcription prompts change meaningfully
pub const MARKDOWN_PROMPT_VERSION: &str = "markdown-v1";

pub const MARKDOWN_SYSTEM_PROMPT: &str = r#"You are an OCR engine that converts document page images to strict Markdown.

Rules:
1. Numbers are sacred: never change any digit, decimal, currency symbol or percentage.
2. Tables use pipe-delimited Markdown with an alignment row (| --- | --- |) and keep the original rows and columns.
3. Transcribe ALL visible text. Nothing may be skipped.
4. Output exactly what you see. Do not correct typos or reformat values.
5. Return ONLY the Markdown. No code fences, no commentary."#;

/// User turn accompanying one page image
pub fn extraction_user_prompt(page_number: usize, total_pages: usize, text_layer: Option<&str>) -> String {
    let mut prompt = format!(
        "Page {} of {}. Extract all content from this page image as JSON.",
        page_number, total_pages
    );
    push_text_layer(&mut prompt, text_layer);
    prompt
}

/// User turn for a Markdown transcription of one page
pub fn markdown_user_prompt(page_number: usize, total_pages: usize, text_layer: Option<&str>) -> String {
    let mut prompt = format!(
        "Page {} of {}. Extract ALL content as valid Markdown. Check every digit of every number \
         and reproduce tables with their exact layout as pipe tables.",
        page_number, total_pages
    );
    push_text_layer(&mut prompt, text_layer);
    prompt
}

fn push_text_layer(prompt: &mut String, text_layer: Option<&str>) {
    if let Some(text) = text_layer.map(str::trim).filter(|t| !t.is_empty()) {
        prompt.push_str(
            "\n\nThe PDF also carries this embedded text layer for the page. Use it to confirm \
             characters, but treat the image as authoritative:\n\"\"\"\n",
        );
        prompt.push_str(text);
        prompt.push_str("\n\"\"\"");
    }
}

pub fn consolidation_user_prompt(page_results: &[Value], conflicts: &[String]) -> String {
    let pages = page_results
        .iter()
        .enumerate()
        .map(|(i, result)| {
            format!(
                "Page {}:\n{}",
                i + 1,
                serde_json::to_string_pretty(result).unwrap_or_else(|_| result.to_string())
            )
        })
        .collect::<Vec<_>>()
        .join("\n\n");

    format!(
        "PAGE RESULTS:\n{}\n\nCONFLICTING FIELDS: {}\n\nMerge these into one JSON object.",
        pages,
        conflicts.join(", ")
    )
}

pub fn conversion_user_prompt(extraction: &Value, schema: &TargetSchema) -> String {
    let mut descriptions = Vec::new();
    for field in schema.fields() {
        if let Some(desc) = &field.description {
            descriptions.push(format!("- {}: {}", field.name, desc));
        }
    }

    let mut prompt = format!(
        "SOURCE DATA:\n{}\n\nTARGET SCHEMA (field name -> type):\n{}\n\nREQUIRED FIELDS: {}",
        serde_json::to_string_pretty(extraction).unwrap_or_else(|_| extraction.to_string()),
        serde_json::to_string_pretty(&schema.describe())
            .unwrap_or_else(|_| schema.describe().to_string()),
        schema.field_names().join(", ")
    );

    if !descriptions.is_empty() {
        prompt.push_str("\n\nFIELD NOTES:\n");
        prompt.push_str(&descriptions.join("\n"));
    }

    prompt.push_str("\n\nConvert the source data to match the target schema exactly.");
    prompt
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn extraction_prompt_is_schema_free() {
        assert!(DEFAULT_EXTRACTION_SYSTEM_PROMPT.contains("natural"));
        assert!(!DEFAULT_EXTRACTION_SYSTEM_PROMPT.contains("TARGET SCHEMA"));
    }

    #[test]
    fn user_prompt_names_page() {
        let prompt = extraction_user_prompt(2, 3, None);
        assert!(prompt.starts_with("Page 2 of 3."));
        assert!(!prompt.contains("text layer"));
    }

    #[test]
    fn user_prompt_includes_text_layer() {
        let prompt = extraction_user_prompt(1, 1, Some("  TOTAL 42.50 \n"));
        assert!(prompt.contains("TOTAL 42.50"));
    }

    #[test]
    fn blank_text_layer_ignored() {
        assert_eq!(
            extraction_user_prompt(1, 1, Some("  \n ")),
            extraction_user_prompt(1, 1, None)
        );
    }

    #[test]
    fn markdown_prompt_names_page_and_text_layer() {
        let prompt = markdown_user_prompt(3, 4, Some("Invoice 0042"));
        assert!(prompt.starts_with("Page 3 of 4."));
        assert!(prompt.contains("Markdown"));
        assert!(prompt.contains("Invoice 0042"));
        assert!(!MARKDOWN_SYSTEM_PROMPT.contains("JSON"));
    }

    #[test]
    fn consolidation_asks_only_for_conflicts() {
        assert!(CONSOLIDATION_SYSTEM_PROMPT.contains("original nested path"));
        assert!(CONSOLIDATION_SYSTEM_PROMPT.contains("omit every other field"));
    }

    #[test]
    fn conversion_prompt_embeds_fields_and_source() {
        let schema = TargetSchema::from_value(&json!({
            "properties": {
                "merchant": {"type": "string", "description": "Business name"},
                "total": {"type": "number"}
            }
        }))
        .unwrap();
        let prompt = conversion_user_prompt(&json!({"restaurant": "Nick the Greek"}), &schema);
        assert!(prompt.contains("Nick the Greek"));
        assert!(prompt.contains("REQUIRED FIELDS: merchant, total"));
        assert!(prompt.contains("- merchant: Business name"));
    }

    #[test]
    fn consolidation_prompt_lists_pages_in_order() {
        let prompt = consolidation_user_prompt(
            &[json!({"total": 1}), json!({"total": 2})],
            &["total".to_string()],
        );
        let first = prompt.find("Page 1:").unwrap();
        let second = prompt.find("Page 2:").unwrap();
        assert!(first < second);
        assert!(prompt.contains("CONFLICTING FIELDS: total"));
    }
}
