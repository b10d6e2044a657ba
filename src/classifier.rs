// 🔎 Column Classifier
// Synonym-based header → field matching with a required-field confidence,
// plus domain auto-detection from headers alone.

use crate::error::{ImportError, Result};
use crate::schema::{normalize_header, Domain, SchemaDefinition};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

// ============================================================================
// RESULTS
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationResult {
    pub detected_domain: Domain,

    /// 0-100, over required target fields
    pub confidence: f64,

    /// Source header → target field name
    pub column_mapping: BTreeMap<String, String>,

    /// Source headers in file order that no field consumed
    pub unmapped_columns: Vec<String>,

    /// True when the caller supplied the mapping
    #[serde(default)]
    pub manual: bool,
}

impl ClassificationResult {
    /// Target fields that received a source column
    pub fn mapped_fields(&self) -> Vec<&str> {
        self.column_mapping.values().map(String::as_str).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainDetection {
    pub domain: Domain,
    pub score: f64,
}

// ============================================================================
// CLASSIFIER
// ============================================================================

pub struct ColumnClassifier {
    /// Best detection score must be strictly greater than this
    pub detection_threshold: f64,
}

impl ColumnClassifier {
    pub fn new(detection_threshold: f64) -> Self {
        ColumnClassifier { detection_threshold }
    }

    /// Score one schema against the file's headers:
    /// fields with any candidate name among the headers / required field count.
    pub fn detection_score(&self, headers: &[String], schema: &SchemaDefinition) -> f64 {
        let normalized: HashSet<String> = headers.iter().map(|h| normalize_header(h)).collect();

        let matched = schema
            .fields
            .iter()
            .filter(|field| field.candidate_names().iter().any(|c| normalized.contains(c)))
            .count();

        let required = schema.required_field_count().max(1);
        matched as f64 / required as f64 * 100.0
    }

    /// Pick the best-scoring schema's domain; `None` when nothing beats the threshold
    pub fn detect_domain(
        &self,
        headers: &[String],
        schemas: &[SchemaDefinition],
    ) -> Option<DomainDetection> {
        let mut best: Option<DomainDetection> = None;

        for schema in schemas.iter().filter(|s| s.is_active) {
            let score = self.detection_score(headers, schema);
            // Strictly greater: the first schema keeps a tie
            if best.as_ref().map_or(true, |b| score > b.score) {
                best = Some(DomainDetection {
                    domain: schema.domain,
                    score,
                });
            }
        }

        best.filter(|b| b.score > self.detection_threshold)
    }

    /// Greedy, order-preserving mapping. Fields are visited in schema order;
    /// each takes the first unconsumed header in file order that matches one
    /// of its candidate names. No backtracking.
    pub fn classify(&self, headers: &[String], schema: &SchemaDefinition) -> ClassificationResult {
        let normalized: Vec<String> = headers.iter().map(|h| normalize_header(h)).collect();
        let mut consumed = vec![false; headers.len()];
        let mut column_mapping = BTreeMap::new();
        let mut matched_required = 0usize;

        for field in &schema.fields {
            let candidates = field.candidate_names();

            let hit = (0..headers.len()).find(|&i| {
                !consumed[i]
                    && !column_mapping.contains_key(&headers[i])
                    && candidates.contains(&normalized[i])
            });

            if let Some(i) = hit {
                consumed[i] = true;
                column_mapping.insert(headers[i].clone(), field.name.clone());
                if schema.is_required(field) {
                    matched_required += 1;
                }
            }
        }

        let unmapped_columns = headers
            .iter()
            .zip(consumed.iter())
            .filter(|(_, used)| !**used)
            .map(|(h, _)| h.clone())
            .collect();

        let required = schema.required_field_count().max(1);
        let confidence = (matched_required as f64 / required as f64 * 100.0).min(100.0);

        ClassificationResult {
            detected_domain: schema.domain,
            confidence,
            column_mapping,
            unmapped_columns,
            manual: false,
        }
    }

    /// Caller-supplied mapping, used verbatim at full confidence
    pub fn apply_manual_mapping(
        &self,
        headers: &[String],
        domain: Domain,
        mapping: &BTreeMap<String, String>,
    ) -> Result<ClassificationResult> {
        check_distinct_targets(mapping)?;

        let unmapped_columns = headers
            .iter()
            .filter(|h| !mapping.contains_key(*h))
            .cloned()
            .collect();

        Ok(ClassificationResult {
            detected_domain: domain,
            confidence: 100.0,
            column_mapping: mapping.clone(),
            unmapped_columns,
            manual: true,
        })
    }
}

/// A target field may receive at most one source header
fn check_distinct_targets(mapping: &BTreeMap<String, String>) -> Result<()> {
    let mut seen: HashSet<&str> = HashSet::new();
    for (header, field) in mapping {
        if field.trim().is_empty() {
            return Err(ImportError::InvalidMapping(format!(
                "header '{}' maps to an empty field name",
                header
            )));
        }
        if !seen.insert(field.as_str()) {
            return Err(ImportError::InvalidMapping(format!(
                "field '{}' receives more than one source header",
                field
            )));
        }
    }
    Ok(())
}

impl Default for ColumnClassifier {
    fn default() -> Self {
        ColumnClassifier::new(crate::config::DEFAULT_DETECTION_THRESHOLD)
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{FieldDefinition, FieldType};

    fn headers(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn products() -> SchemaDefinition {
        SchemaDefinition::new(Domain::Products, "products")
            .with_field(
                FieldDefinition::new("name", FieldType::String)
                    .required()
                    .with_synonym("product_name"),
            )
            .with_field(
                FieldDefinition::new("price", FieldType::Number)
                    .required()
                    .with_synonym("unit price"),
            )
            .with_field(FieldDefinition::new("sku", FieldType::String).with_synonym("item code"))
    }

    fn machines() -> SchemaDefinition {
        SchemaDefinition::new(Domain::Machines, "machines")
            .with_field(
                FieldDefinition::new("serial_number", FieldType::String)
                    .required()
                    .with_synonym("serial"),
            )
            .with_field(FieldDefinition::new("model", FieldType::String).required())
            .with_field(FieldDefinition::new("location", FieldType::String))
    }

    #[test]
    fn test_confidence_full_and_half() {
        let classifier = ColumnClassifier::default();

        let full = classifier.classify(&headers(&["Product Name", "Unit-Price"]), &products());
        assert_eq!(full.confidence, 100.0);
        assert_eq!(full.column_mapping["Product Name"], "name");
        assert_eq!(full.column_mapping["Unit-Price"], "price");

        let half = classifier.classify(&headers(&["product_name", "colour"]), &products());
        assert_eq!(half.confidence, 50.0);
        assert_eq!(half.unmapped_columns, headers(&["colour"]));
    }

    #[test]
    fn test_extra_columns_do_not_lower_confidence() {
        let classifier = ColumnClassifier::default();
        let result = classifier.classify(
            &headers(&["a", "b", "name", "c", "price", "d", "e"]),
            &products(),
        );

        assert_eq!(result.confidence, 100.0);
        assert_eq!(result.unmapped_columns, headers(&["a", "b", "c", "d", "e"]));
    }

    #[test]
    fn test_no_double_consumption() {
        let schema = SchemaDefinition::new(Domain::Products, "products").with_field(
            FieldDefinition::new("name", FieldType::String)
                .required()
                .with_synonym("product_name"),
        );

        let file = headers(&["Product Name", "price", "Product Name"]);
        let result = ColumnClassifier::default().classify(&file, &schema);

        assert_eq!(result.column_mapping.len(), 1);
        assert_eq!(result.column_mapping["Product Name"], "name");
        // The second "Product Name" (index 2) stays unmapped
        assert_eq!(result.unmapped_columns, headers(&["price", "Product Name"]));
    }

    #[test]
    fn test_consumed_header_unavailable_to_later_fields() {
        // Both fields accept "code"; only the first field in schema order gets it
        let schema = SchemaDefinition::new(Domain::Products, "products")
            .with_field(FieldDefinition::new("sku", FieldType::String).with_synonym("code"))
            .with_field(FieldDefinition::new("barcode", FieldType::String).with_synonym("code"));

        let result = ColumnClassifier::default().classify(&headers(&["code"]), &schema);
        assert_eq!(result.column_mapping["code"], "sku");
        assert!(!result.mapped_fields().contains(&"barcode"));
    }

    #[test]
    fn test_classification_is_deterministic() {
        let classifier = ColumnClassifier::default();
        let file = headers(&["Item Code", "name", "price", "extra"]);

        let first = classifier.classify(&file, &products());
        let second = classifier.classify(&file, &products());
        assert_eq!(first, second);
    }

    #[test]
    fn test_zero_required_fields_scores_zero() {
        let schema = SchemaDefinition::new(Domain::Locations, "locations")
            .with_field(FieldDefinition::new("city", FieldType::String));

        let result = ColumnClassifier::default().classify(&headers(&["city"]), &schema);
        assert_eq!(result.column_mapping.len(), 1);
        assert_eq!(result.confidence, 0.0);
    }

    #[test]
    fn test_detect_domain() {
        let classifier = ColumnClassifier::default();
        let schemas = vec![products(), machines()];

        let detected = classifier
            .detect_domain(&headers(&["Serial", "Model", "Location"]), &schemas)
            .unwrap();
        assert_eq!(detected.domain, Domain::Machines);
        assert_eq!(detected.score, 150.0);

        let detected = classifier
            .detect_domain(&headers(&["name", "price"]), &schemas)
            .unwrap();
        assert_eq!(detected.domain, Domain::Products);
    }

    #[test]
    fn test_detect_domain_below_threshold() {
        let classifier = ColumnClassifier::default();
        let schemas = vec![products(), machines()];

        assert!(classifier.detect_domain(&headers(&["foo", "bar"]), &schemas).is_none());

        // A score equal to the threshold is not enough
        let strict = ColumnClassifier::new(50.0);
        assert!(strict.detect_domain(&headers(&["name"]), &schemas).is_none());
    }

    #[test]
    fn test_manual_mapping() {
        let classifier = ColumnClassifier::default();
        let mut mapping = BTreeMap::new();
        mapping.insert("Col A".to_string(), "name".to_string());
        mapping.insert("Col B".to_string(), "price".to_string());

        let result = classifier
            .apply_manual_mapping(&headers(&["Col A", "Col B", "Col C"]), Domain::Products, &mapping)
            .unwrap();

        assert!(result.manual);
        assert_eq!(result.confidence, 100.0);
        assert_eq!(result.unmapped_columns, headers(&["Col C"]));
    }

    #[test]
    fn test_manual_mapping_rejects_shared_target() {
        let classifier = ColumnClassifier::default();
        let mut mapping = BTreeMap::new();
        mapping.insert("A".to_string(), "name".to_string());
        mapping.insert("B".to_string(), "name".to_string());

        let err = classifier
            .apply_manual_mapping(&headers(&["A", "B"]), Domain::Products, &mapping)
            .unwrap_err();
        assert!(matches!(err, ImportError::InvalidMapping(_)));
    }
}
