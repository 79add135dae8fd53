//! Attribute and relationship descriptors.

/// What happens to referencing instances when the referenced instance is deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReferentialAction {
    /// Required references block the delete; nullable ones are cleared.
    #[default]
    NoAction,
    /// Always block the delete while references exist.
    Restrict,
    /// Delete referencing instances along with the target.
    Cascade,
    /// Clear the referencing attribute (the attribute must be nullable).
    SetNull,
}

impl ReferentialAction {
    /// Get the SQL representation of this action.
    #[must_use]
    pub const fn as_sql(&self) -> &'static str {
        match self {
            ReferentialAction::NoAction => "NO ACTION",
            ReferentialAction::Restrict => "RESTRICT",
            ReferentialAction::Cascade => "CASCADE",
            ReferentialAction::SetNull => "SET NULL",
        }
    }

    /// Parse a referential action from a string (case-insensitive).
    #[must_use]
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "NO ACTION" | "NOACTION" | "NO_ACTION" => Some(ReferentialAction::NoAction),
            "RESTRICT" => Some(ReferentialAction::Restrict),
            "CASCADE" => Some(ReferentialAction::Cascade),
            "SET NULL" | "SETNULL" | "SET_NULL" => Some(ReferentialAction::SetNull),
            _ => None,
        }
    }
}

/// A many-to-one relationship stored in a foreign-key attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reference {
    /// Name of the referenced entity.
    pub target: &'static str,
    /// Delete policy toward the referencing side.
    pub on_delete: ReferentialAction,
}

/// Metadata about one persistent attribute of an entity.
#[derive(Debug, Clone, Copy)]
pub struct AttributeInfo {
    /// Attribute name used by application code
    pub name: &'static str,
    /// Database column name (may differ from attribute name)
    pub column: &'static str,
    /// Whether NULL is a legal stored value
    pub nullable: bool,
    /// Whether this attribute is part of the primary key
    pub primary_key: bool,
    /// Whether the backend generates the value on insert
    pub auto_increment: bool,
    /// Whether this attribute has a unique constraint
    pub unique: bool,
    /// Whether the backend may change the value behind the session's back.
    /// Volatile attributes never get a snapshot or a dirty flag.
    pub volatile: bool,
    /// Whether the column is left out of default selects and fetched on first access
    pub lazy: bool,
    /// Whether the backend supplies a default when the attribute is omitted
    pub has_default: bool,
    /// Relationship carried by this attribute, if it is a foreign key
    pub reference: Option<Reference>,
}

impl AttributeInfo {
    /// Create a new attribute whose column name equals its name.
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            column: name,
            nullable: false,
            primary_key: false,
            auto_increment: false,
            unique: false,
            volatile: false,
            lazy: false,
            has_default: false,
            reference: None,
        }
    }

    /// Set the database column name.
    pub const fn column(mut self, column: &'static str) -> Self {
        self.column = column;
        self
    }

    pub const fn nullable(mut self, value: bool) -> Self {
        self.nullable = value;
        self
    }

    pub const fn primary_key(mut self, value: bool) -> Self {
        self.primary_key = value;
        self
    }

    /// Mark the attribute as backend-generated (implies it may be omitted on insert).
    pub const fn auto_increment(mut self, value: bool) -> Self {
        self.auto_increment = value;
        self
    }

    pub const fn unique(mut self, value: bool) -> Self {
        self.unique = value;
        self
    }

    pub const fn volatile(mut self, value: bool) -> Self {
        self.volatile = value;
        self
    }

    pub const fn lazy(mut self, value: bool) -> Self {
        self.lazy = value;
        self
    }

    pub const fn has_default(mut self, value: bool) -> Self {
        self.has_default = value;
        self
    }

    /// Declare this attribute a foreign key to `target`.
    pub const fn references(mut self, target: &'static str, on_delete: ReferentialAction) -> Self {
        self.reference = Some(Reference { target, on_delete });
        self
    }

    /// Whether `create` must receive a value for this attribute.
    pub const fn is_required(&self) -> bool {
        !self.nullable && !self.auto_increment && !self.has_default
    }

    /// Whether the attribute takes part in snapshots and dirty detection.
    pub const fn is_tracked(&self) -> bool {
        !self.volatile
    }

    pub const fn is_reference(&self) -> bool {
        self.reference.is_some()
    }
}
