#![forbid(unsafe_code)]

pub mod sql {
    /// Quotes `value` as a SQL string literal the way `quote_literal()` does:
    /// quotes and backslashes are doubled and a backslash switches the literal
    /// to the `E''` form.
    #[must_use]
    pub fn quote_literal(value: &str) -> String {
        let mut quoted = String::with_capacity(value.len() + 3);
        if value.contains('\\') {
            quoted.push('E');
        }
        quoted.push('\'');
        for ch in value.chars() {
            if ch == '\'' || ch == '\\' {
                quoted.push(ch);
            }
            quoted.push(ch);
        }
        quoted.push('\'');
        quoted
    }

    #[must_use]
    pub fn quote_nullable(value: Option<&str>) -> String {
        match value {
            Some(value) => quote_literal(value),
            None => "NULL".to_string(),
        }
    }
}

pub mod signature {
    /// How a function signature string has to be resolved against the catalog.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum SignatureForm {
        /// Bare name, optionally schema-qualified (`regproc`).
        Name,
        /// Name with an argument list (`regprocedure`).
        NameWithArgs,
    }

    impl SignatureForm {
        #[must_use]
        pub fn detect(signature: &str) -> Self {
            if signature.contains('(') { Self::NameWithArgs } else { Self::Name }
        }

        #[must_use]
        pub fn regtype(self) -> &'static str {
            match self {
                Self::Name => "regproc",
                Self::NameWithArgs => "regprocedure",
            }
        }
    }
}
