//! Naming helpers for entity, table and column names.

use heck::ToSnakeCase;

/// Entity name for a Rust type: the snake_case of its last path segment.
///
/// `billing::LineItem` becomes `line_item`. Generic arguments are ignored.
pub fn entity_name_of<T: ?Sized>() -> String {
    type_base_name(std::any::type_name::<T>()).to_snake_case()
}

/// Last path segment of a type name, without generic arguments.
pub fn type_base_name(full: &str) -> &str {
    let without_generics = full.split('<').next().unwrap_or(full);
    without_generics
        .rsplit("::")
        .next()
        .unwrap_or(without_generics)
}

pub fn pluralize(word: &str) -> String {
    pluralizer::pluralize(word, 2, false)
}

pub fn singularize(word: &str) -> String {
    pluralizer::pluralize(word, 1, false)
}

/// Foreign key column pointing at an entity: `<entity>_id`.
pub fn foreign_key(entity: &str) -> String {
    format!("{entity}_id")
}
