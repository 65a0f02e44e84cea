use {
    crate::error::{Error, Result},
    std::{collections::HashMap, iter::Peekable, str::CharIndices},
};

/// Parses the `repr()` rendering of a string list (or tuple) as produced by
/// the SUT-side interceptors, e.g. `['grep', '-r', "it's"]`
pub fn parse_str_list(input: &str) -> Result<Vec<String>> {
    let mut parser = Parser::new(input);
    let list = parser.str_list()?;
    parser.ensure_end()?;
    Ok(list)
}

/// Parses the `repr()` rendering of a string to string dictionary, which is
/// how the SUT ships its environment snapshot over the wire
pub fn parse_str_map(input: &str) -> Result<HashMap<String, String>> {
    let mut parser = Parser::new(input);
    let map = parser.str_map()?;
    parser.ensure_end()?;
    Ok(map)
}

struct Parser<'a> {
    iter: Peekable<CharIndices<'a>>,
    len: usize,
}

impl<'a> Parser<'a> {
    fn new(input: &'a str) -> Self {
        Self {
            iter: input.char_indices().peekable(),
            len: input.len(),
        }
    }

    fn fail<T>(&mut self, reason: &'static str) -> Result<T> {
        let offset = self.iter.peek().map(|(i, _)| *i).unwrap_or(self.len);
        Err(Error::Literal { offset, reason })
    }

    fn skip_ws(&mut self) {
        while matches!(self.iter.peek(), Some((_, c)) if c.is_whitespace()) {
            self.iter.next();
        }
    }

    fn eat(&mut self, expected: char) -> bool {
        match self.iter.peek() {
            Some((_, c)) if *c == expected => {
                self.iter.next();
                true
            }
            _ => false,
        }
    }

    fn string(&mut self) -> Result<String> {
        let quote = match self.iter.next() {
            Some((_, c)) if c == '\'' || c == '"' => c,
            _ => return self.fail("expected a quoted string"),
        };

        let mut out = String::new();
        loop {
            match self.iter.next() {
                Some((_, c)) if c == quote => return Ok(out),
                Some((_, '\\')) => match self.iter.next() {
                    Some((_, 'n')) => out.push('\n'),
                    Some((_, 't')) => out.push('\t'),
                    Some((_, 'r')) => out.push('\r'),
                    Some((_, '0')) => out.push('\0'),
                    Some((_, c)) if c == '\\' || c == '\'' || c == '"' => out.push(c),
                    // Unknown escapes pass through as written
                    Some((_, c)) => {
                        out.push('\\');
                        out.push(c);
                    }
                    None => return self.fail("dangling escape"),
                },
                Some((_, c)) => out.push(c),
                None => return self.fail("unterminated string"),
            }
        }
    }

    fn str_list(&mut self) -> Result<Vec<String>> {
        self.skip_ws();
        let close = if self.eat('[') {
            ']'
        } else if self.eat('(') {
            ')'
        } else {
            return self.fail("expected a list or tuple");
        };

        let mut items = Vec::new();
        loop {
            self.skip_ws();
            if self.eat(close) {
                return Ok(items);
            }
            items.push(self.string()?);
            self.skip_ws();
            if self.eat(close) {
                return Ok(items);
            }
            if !self.eat(',') {
                return self.fail("expected ',' or the closing bracket");
            }
        }
    }

    fn str_map(&mut self) -> Result<HashMap<String, String>> {
        self.skip_ws();
        if !self.eat('{') {
            return self.fail("expected a dictionary");
        }

        let mut map = HashMap::new();
        loop {
            self.skip_ws();
            if self.eat('}') {
                return Ok(map);
            }
            let key = self.string()?;
            self.skip_ws();
            if !self.eat(':') {
                return self.fail("expected ':' after dictionary key");
            }
            self.skip_ws();
            let value = self.string()?;
            map.insert(key, value);
            self.skip_ws();
            if !self.eat(',') {
                if self.eat('}') {
                    return Ok(map);
                }
                return self.fail("expected ',' or '}'");
            }
        }
    }

    fn ensure_end(&mut self) -> Result<()> {
        self.skip_ws();
        if self.iter.peek().is_some() {
            self.fail("trailing characters after literal")
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn argv_list_round_trip() {
        let argv = parse_str_list(r#"['grep', '-r', "it's", 'a b']"#).unwrap();
        assert_eq!(argv, vec!["grep", "-r", "it's", "a b"]);
    }

    #[test]
    fn tuple_and_trailing_comma() {
        assert_eq!(parse_str_list("('ls',)").unwrap(), vec!["ls"]);
        assert_eq!(parse_str_list("[]").unwrap(), Vec::<String>::new());
    }

    #[test]
    fn escapes_are_decoded() {
        let argv = parse_str_list(r"['a\nb', 'c\\d', 'e\'f']").unwrap();
        assert_eq!(argv, vec!["a\nb", "c\\d", "e'f"]);
    }

    #[test]
    fn environment_map() {
        let env = parse_str_map(r#"{'PATH': '/usr/bin', 'HOME': '/home/sut'}"#).unwrap();
        assert_eq!(env.len(), 2);
        assert_eq!(env["PATH"], "/usr/bin");
        assert_eq!(env["HOME"], "/home/sut");
        assert!(parse_str_map("{}").unwrap().is_empty());
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(parse_str_list("not a list").is_err());
        assert!(parse_str_list("['unterminated").is_err());
        assert!(parse_str_map("{'KEY' '/usr/bin'}").is_err());
    }
}
