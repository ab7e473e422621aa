//! Command descriptors.
//!
//! The core never interprets arguments: they are opaque JSON values whose only
//! meaningful property here is their order.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One command of a pipeline: a name plus positional and named arguments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
	pub name: String,
	#[serde(default, skip_serializing_if = "Vec::is_empty")]
	pub arguments: Vec<Argument>,
}

/// A single argument. Positional when `name` is `None`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Argument {
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub name: Option<String>,
	pub value: Value,
}

impl Command {
	pub fn new(name: impl Into<String>) -> Self {
		Self {
			name: name.into(),
			arguments: Vec::new(),
		}
	}

	/// Appends a positional argument.
	pub fn arg(mut self, value: impl Into<Value>) -> Self {
		self.arguments.push(Argument {
			name: None,
			value: value.into(),
		});
		self
	}

	/// Appends a named argument.
	pub fn param(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
		self.arguments.push(Argument {
			name: Some(name.into()),
			value: value.into(),
		});
		self
	}

	/// Positional arguments in order.
	pub fn positional(&self) -> impl Iterator<Item = &Value> {
		self.arguments
			.iter()
			.filter(|argument| argument.is_positional())
			.map(|argument| &argument.value)
	}

	/// Looks up a named argument (case-insensitive, like shell parameters).
	pub fn named(&self, name: &str) -> Option<&Value> {
		self.arguments
			.iter()
			.find(|argument| {
				argument
					.name
					.as_deref()
					.is_some_and(|n| n.eq_ignore_ascii_case(name))
			})
			.map(|argument| &argument.value)
	}
}

impl Argument {
	pub fn is_positional(&self) -> bool {
		self.name.is_none()
	}
}
