pub(crate) mod table_definitions;

/// Quotes an SQLite identifier, doubling any embedded quote.
pub(crate) fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quotes_are_doubled() {
        assert_eq!(quote_ident("roads"), "\"roads\"");
        assert_eq!(quote_ident("a\"b"), "\"a\"\"b\"");
    }
}
