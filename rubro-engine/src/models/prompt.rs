//! Prompt and category models

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One classification category as presented to the model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Category {
    pub id: i64,
    pub name: String,
    pub description: String,
    /// Lower numbers are listed first in the compiled prompt
    pub priority: i64,
    #[serde(default)]
    pub keywords: Vec<String>,
}

/// A versioned, compilable prompt template
///
/// Templates use `{categories}` as the substitution point for the rendered
/// category list. There is no implicit default prompt; callers must pick one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Prompt {
    pub id: Uuid,
    pub name: String,
    pub label: String,
    pub template: String,
    pub categories: Vec<Category>,
    pub is_default: bool,
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Prompt {
    pub fn new(name: &str, label: &str, template: &str, categories: Vec<Category>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            name: name.to_string(),
            label: label.to_string(),
            template: template.to_string(),
            categories,
            is_default: false,
            version: 1,
            created_at: now,
            updated_at: now,
        }
    }

    /// Render the template with its category list substituted in
    ///
    /// Pure: identical prompt state always compiles to identical text.
    pub fn compile(&self) -> String {
        let mut categories = self.categories.clone();
        categories.sort_by_key(|c| (c.priority, c.id));

        let rendered: Vec<String> = categories
            .iter()
            .map(|c| {
                if c.keywords.is_empty() {
                    format!("- {}: {}", c.name, c.description)
                } else {
                    format!(
                        "- {}: {} (palabras clave: {})",
                        c.name,
                        c.description,
                        c.keywords.join(", ")
                    )
                }
            })
            .collect();

        self.template.replace("{categories}", &rendered.join("\n"))
    }

    /// Names of the categories, in prompt order
    pub fn category_names(&self) -> Vec<String> {
        let mut categories = self.categories.clone();
        categories.sort_by_key(|c| (c.priority, c.id));
        categories.into_iter().map(|c| c.name).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_prompt() -> Prompt {
        Prompt::new(
            "gastos",
            "gastos-v1",
            "Clasifica cada registro en una de estas categorias:\n{categories}\nResponde JSON.",
            vec![
                Category {
                    id: 2,
                    name: "Medios".to_string(),
                    description: "Publicidad en medios".to_string(),
                    priority: 2,
                    keywords: vec!["revista".to_string(), "radio".to_string()],
                },
                Category {
                    id: 1,
                    name: "Pop".to_string(),
                    description: "Material punto de venta".to_string(),
                    priority: 1,
                    keywords: vec![],
                },
            ],
        )
    }

    #[test]
    fn test_compile_orders_by_priority() {
        let text = sample_prompt().compile();
        let pop = text.find("- Pop:").unwrap();
        let medios = text.find("- Medios:").unwrap();
        assert!(pop < medios);
        assert!(text.contains("palabras clave: revista, radio"));
    }

    #[test]
    fn test_compile_is_deterministic() {
        let prompt = sample_prompt();
        assert_eq!(prompt.compile(), prompt.compile());
    }
}
