//! Positional field decoding.
//!
//! A message body is a list of tokens separated by one delimiter character.
//! Each record kind declares, once, what to do with the token at each
//! position: verify a literal tag, skip it, parse it into a field, or branch
//! on a set of literals. The declaration is compiled into a [`Schema`] which
//! is then applied to every incoming body of that kind.
//!
//! ```
//! use printlink_protocol::Schema;
//!
//! #[derive(Default)]
//! struct Offset {
//!     value: f64,
//! }
//!
//! let schema = Schema::<Offset>::builder(':')
//!     .tag("ZOffsetValue")
//!     .field(|r, v: f64| r.value = v)
//!     .build();
//!
//! let mut record = Offset::default();
//! assert!(schema.apply("ZOffsetValue:1.25", &mut record));
//! assert_eq!(record.value, 1.25);
//! ```

use std::fmt;
use std::str::FromStr;

type ParseFn<R> = Box<dyn Fn(&mut R, &str) + Send + Sync>;

enum FieldAction<R> {
    /// Token must equal the literal exactly.
    Tag(&'static str),
    /// Token is consumed without effect.
    Skip,
    /// Token (minus an optional literal prefix) is parsed into a field.
    Field {
        prefix: Option<&'static str>,
        parse: ParseFn<R>,
    },
    /// Token must equal one of the literals; the matching arm sets a field.
    Branch(Vec<(&'static str, fn(&mut R))>),
}

impl<R> fmt::Debug for FieldAction<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldAction::Tag(tag) => write!(f, "Tag({tag:?})"),
            FieldAction::Skip => write!(f, "Skip"),
            FieldAction::Field { prefix, .. } => write!(f, "Field(prefix={prefix:?})"),
            FieldAction::Branch(arms) => {
                let tags: Vec<_> = arms.iter().map(|(tag, _)| *tag).collect();
                write!(f, "Branch({tags:?})")
            }
        }
    }
}

/// Compiled, immutable list of per-token actions for one record kind.
pub struct Schema<R> {
    delimiter: char,
    actions: Vec<FieldAction<R>>,
}

impl<R: 'static> Schema<R> {
    /// Starts building a schema for bodies split on `delimiter`.
    pub fn builder(delimiter: char) -> SchemaBuilder<R> {
        SchemaBuilder {
            delimiter,
            actions: Vec::new(),
        }
    }
}

impl<R> Schema<R> {
    /// Applies the schema to `body`, writing parsed fields into `record`.
    ///
    /// Returns `false` as soon as a tag, prefix or branch does not match.
    /// Tokens past the last action are ignored, and a body shorter than the
    /// schema leaves the unreached fields untouched without failing.
    ///
    /// A token that fails to parse leaves its field unchanged and does not
    /// fail the decode.
    pub fn apply(&self, body: &str, record: &mut R) -> bool {
        for (action, token) in self.actions.iter().zip(body.split(self.delimiter)) {
            match action {
                FieldAction::Tag(expected) => {
                    if token != *expected {
                        return false;
                    }
                }
                FieldAction::Skip => {}
                FieldAction::Field { prefix, parse } => {
                    let value = match prefix {
                        Some(prefix) => match token.strip_prefix(prefix) {
                            Some(value) => value,
                            None => return false,
                        },
                        None => token,
                    };
                    parse(record, value);
                }
                FieldAction::Branch(arms) => match arms.iter().find(|(tag, _)| *tag == token) {
                    Some((_, set)) => set(record),
                    None => return false,
                },
            }
        }
        true
    }

    /// Returns the delimiter this schema splits bodies on.
    pub fn delimiter(&self) -> char {
        self.delimiter
    }

    /// Returns the number of token positions the schema covers.
    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }
}

impl<R> fmt::Debug for Schema<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Schema")
            .field("delimiter", &self.delimiter)
            .field("actions", &self.actions)
            .finish()
    }
}

/// Builder for [`Schema`]. Actions apply to consecutive token positions.
pub struct SchemaBuilder<R> {
    delimiter: char,
    actions: Vec<FieldAction<R>>,
}

impl<R: 'static> SchemaBuilder<R> {
    /// Requires the next token to equal `tag`.
    pub fn tag(mut self, tag: &'static str) -> Self {
        self.actions.push(FieldAction::Tag(tag));
        self
    }

    /// Ignores the next token.
    pub fn skip(mut self) -> Self {
        self.actions.push(FieldAction::Skip);
        self
    }

    /// Ignores the next `n` tokens.
    pub fn skip_n(mut self, n: usize) -> Self {
        self.actions.extend((0..n).map(|_| FieldAction::Skip));
        self
    }

    /// Parses the next token as `T` and hands it to `set`.
    pub fn field<T: FromStr + 'static>(self, set: fn(&mut R, T)) -> Self {
        self.push_field(None, set)
    }

    /// Requires the next token to start with `prefix` and parses the rest as `T`.
    pub fn prefixed_field<T: FromStr + 'static>(
        self,
        prefix: &'static str,
        set: fn(&mut R, T),
    ) -> Self {
        self.push_field(Some(prefix), set)
    }

    /// Requires the next token to equal one of the arm literals and runs the
    /// matching arm.
    pub fn branch(mut self, arms: &[(&'static str, fn(&mut R))]) -> Self {
        self.actions.push(FieldAction::Branch(arms.to_vec()));
        self
    }

    pub fn build(self) -> Schema<R> {
        Schema {
            delimiter: self.delimiter,
            actions: self.actions,
        }
    }

    fn push_field<T: FromStr + 'static>(
        mut self,
        prefix: Option<&'static str>,
        set: fn(&mut R, T),
    ) -> Self {
        let parse: ParseFn<R> = Box::new(move |record, token| {
            if let Ok(value) = token.parse::<T>() {
                set(record, value);
            }
        });
        self.actions.push(FieldAction::Field { prefix, parse });
        self
    }
}
