//! Parser for the text form of the IR.

use hashbrown::HashMap;

use super::{ConstAttr, ElemType, Module, OpId, OpKind, ShapedKind, ShapedType, Type, ValueId};
use crate::core::error::{IrError, IrResult};

pub fn parse_module(text: &str) -> IrResult<Module> {
    let parser = Parser::new(text);
    parser.parse()
}

struct Parser<'a> {
    text: &'a str,
    pos: usize,
    module: Module,

    // Per-function value names
    values: HashMap<&'a str, ValueId>,
}

impl<'a> Parser<'a> {
    fn new(text: &'a str) -> Self {
        Self {
            text,
            pos: 0,
            module: Module::new(),
            values: HashMap::new(),
        }
    }

    fn parse(mut self) -> IrResult<Module> {
        self.skip_whitespace();

        while !self.is_eof() {
            if let Err(e) = self.parse_function() {
                log::debug!("Error parsing function at position {}: {}", self.pos, e);
                return Err(e);
            }
            self.skip_whitespace();
        }

        Ok(self.module)
    }

    fn error<T>(&self, message: impl Into<String>) -> IrResult<T> {
        Err(IrError::Parse { pos: self.pos, message: message.into() })
    }

    fn is_eof(&self) -> bool {
        self.pos >= self.text.len()
    }

    fn current_char(&self) -> Option<char> {
        self.text[self.pos..].chars().next()
    }

    fn advance(&mut self) {
        if let Some(ch) = self.current_char() {
            self.pos += ch.len_utf8();
        }
    }

    fn skip_whitespace(&mut self) {
        while let Some(ch) = self.current_char() {
            if ch == ';' {
                // Skip comment line
                while let Some(ch) = self.current_char() {
                    self.advance();
                    if ch == '\n' {
                        break;
                    }
                }
            } else if ch.is_whitespace() {
                self.advance();
            } else {
                break;
            }
        }
    }

    fn peek(&mut self) -> Option<char> {
        self.skip_whitespace();
        self.current_char()
    }

    fn try_read(&mut self, ch: char) -> bool {
        if self.peek() == Some(ch) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, ch: char) -> IrResult<()> {
        if !self.try_read(ch) {
            return self.error(format!("Expected '{}' but found {:?}", ch, self.current_char()));
        }
        Ok(())
    }

    fn read_word(&mut self) -> &'a str {
        self.skip_whitespace();
        let start = self.pos;
        while let Some(ch) = self.current_char() {
            if ch.is_alphanumeric() || ch == '_' {
                self.advance();
            } else {
                break;
            }
        }
        &self.text[start..self.pos]
    }

    fn read_identifier(&mut self) -> IrResult<&'a str> {
        let word = self.read_word();
        if word.is_empty() {
            return self.error(format!("Expected identifier but found {:?}", self.current_char()));
        }
        Ok(word)
    }

    fn expect_keyword(&mut self, keyword: &str) -> IrResult<()> {
        let start = self.pos;
        let word = self.read_word();
        if word != keyword {
            self.pos = start;
            return self.error(format!("Expected '{}' but found '{}'", keyword, word));
        }
        Ok(())
    }

    fn read_value_name(&mut self) -> IrResult<&'a str> {
        self.expect('%')?;
        self.read_identifier()
    }

    fn read_integer(&mut self) -> IrResult<i64> {
        self.skip_whitespace();
        let start = self.pos;
        if self.current_char() == Some('-') {
            self.advance();
        }
        while self.current_char().is_some_and(|c| c.is_ascii_digit()) {
            self.advance();
        }
        let text = &self.text[start..self.pos];
        text.parse::<i64>().or_else(|_| self.error(format!("Invalid integer '{}'", text)))
    }

    fn read_number(&mut self) -> IrResult<ConstAttr> {
        self.skip_whitespace();
        let start = self.pos;
        if self.current_char() == Some('-') {
            self.advance();
        }
        let mut is_float = false;
        while let Some(ch) = self.current_char() {
            if ch.is_ascii_digit() {
                self.advance();
            } else if ch == '.' || ch == 'e' || ch == 'E' {
                is_float = true;
                self.advance();
                if matches!(self.current_char(), Some('-') | Some('+')) {
                    self.advance();
                }
            } else {
                break;
            }
        }
        let text = &self.text[start..self.pos];
        if is_float {
            text.parse::<f64>()
                .map(ConstAttr::Float)
                .or_else(|_| self.error(format!("Invalid number '{}'", text)))
        } else {
            text.parse::<i64>()
                .map(ConstAttr::Int)
                .or_else(|_| self.error(format!("Invalid number '{}'", text)))
        }
    }

    fn read_type(&mut self) -> IrResult<Type> {
        let word = self.read_identifier()?;
        let kind = match word {
            "index" => return Ok(Type::Index),
            "vector" => ShapedKind::Vector,
            "memref" => ShapedKind::MemRef,
            "tile" => ShapedKind::Tile,
            other => {
                return ElemType::from_str(other)
                    .map(Type::Scalar)
                    .ok_or(())
                    .or_else(|_| self.error(format!("Unknown type '{}'", other)));
            }
        };

        self.expect('<')?;
        let start = self.pos;
        while self.current_char().is_some_and(|c| c != '>') {
            self.advance();
        }
        let body = self.text[start..self.pos].trim();
        self.expect('>')?;

        let mut parts: Vec<&str> = body.split('x').collect();
        let elem_name = parts.pop().unwrap_or_default();
        let Some(elem) = ElemType::from_str(elem_name) else {
            return self.error(format!("Unknown element type '{}'", elem_name));
        };
        let mut shape = Vec::with_capacity(parts.len());
        for part in parts {
            match part.parse::<i64>() {
                Ok(dim) if dim > 0 => shape.push(dim),
                _ => return self.error(format!("Invalid dimension '{}'", part)),
            }
        }
        if shape.is_empty() {
            return self.error("Shaped type needs at least one dimension");
        }
        Ok(Type::shaped(kind, ShapedType::new(shape, elem)))
    }

    fn define(&mut self, name: &'a str, value: ValueId) -> IrResult<()> {
        if self.values.insert(name, value).is_some() {
            return self.error(format!("Redefinition of value %{}", name));
        }
        self.module.set_value_name(value, name);
        Ok(())
    }

    fn read_value(&mut self) -> IrResult<ValueId> {
        let name = self.read_value_name()?;
        match self.values.get(name) {
            Some(&v) => Ok(v),
            None => self.error(format!("Undefined value %{}", name)),
        }
    }

    fn read_value_list(&mut self) -> IrResult<Vec<ValueId>> {
        let mut values = Vec::new();
        if self.peek() != Some('%') {
            return Ok(values);
        }
        loop {
            values.push(self.read_value()?);
            if !self.try_read(',') {
                break;
            }
        }
        Ok(values)
    }

    /// `%mem[%i, %j]`
    fn read_access(&mut self) -> IrResult<Vec<ValueId>> {
        let mut operands = vec![self.read_value()?];
        self.expect('[')?;
        if !self.try_read(']') {
            operands.extend(self.read_value_list()?);
            self.expect(']')?;
        }
        Ok(operands)
    }

    /// `{masked, packed}`
    fn read_flags(&mut self) -> IrResult<Vec<&'a str>> {
        let mut flags = Vec::new();
        if !self.try_read('{') {
            return Ok(flags);
        }
        loop {
            flags.push(self.read_identifier()?);
            if !self.try_read(',') {
                break;
            }
        }
        self.expect('}')?;
        Ok(flags)
    }

    fn read_result_type(&mut self) -> IrResult<Type> {
        self.expect(':')?;
        self.read_type()
    }

    fn parse_function(&mut self) -> IrResult<()> {
        self.expect_keyword("func")?;
        self.expect('@')?;
        let name = self.read_identifier()?;
        self.values.clear();

        self.expect('(')?;
        let mut args = Vec::new();
        if !self.try_read(')') {
            loop {
                let arg_name = self.read_value_name()?;
                self.expect(':')?;
                let ty = self.read_type()?;
                args.push((arg_name, ty));
                if !self.try_read(',') {
                    break;
                }
            }
            self.expect(')')?;
        }

        let func = self.module.add_func(name, args.iter().map(|(_, ty)| ty.clone()).collect());
        let body = self.module.func_body(func);
        let arg_values = self.module.block(body).args.clone();
        for ((arg_name, _), value) in args.into_iter().zip(arg_values) {
            self.define(arg_name, value)?;
        }

        self.expect('{')?;
        self.parse_block_body(body)?;
        Ok(())
    }

    /// Parse ops until the closing brace.
    fn parse_block_body(&mut self, block: super::BlockId) -> IrResult<()> {
        loop {
            if self.try_read('}') {
                return Ok(());
            }
            if self.is_eof() {
                return self.error("Unexpected end of input inside a block");
            }
            self.parse_op(block)?;
        }
    }

    fn parse_op(&mut self, block: super::BlockId) -> IrResult<()> {
        let mut result_names = Vec::new();
        if self.peek() == Some('%') {
            loop {
                result_names.push(self.read_value_name()?);
                if !self.try_read(',') {
                    break;
                }
            }
            self.expect('=')?;
        }

        let op_start = self.pos;
        let op_name = self.read_identifier()?;
        let op = match op_name {
            "for" => self.parse_for(block)?,
            _ => {
                let (kind, operands, result_ty) = self.parse_simple_op(op_name)?;
                let op = self.module.create_op(kind, operands, result_ty.into_iter().collect());
                self.module.append_op(op, block);
                op
            }
        };

        let results = self.module.op(op).results.clone();
        if results.len() != result_names.len() {
            self.pos = op_start;
            return self.error(format!(
                "'{}' produces {} result(s) but {} name(s) were given",
                op_name,
                results.len(),
                result_names.len()
            ));
        }
        for (name, value) in result_names.into_iter().zip(results) {
            self.define(name, value)?;
        }
        Ok(())
    }

    fn parse_simple_op(&mut self, op_name: &str) -> IrResult<(OpKind, Vec<ValueId>, Option<Type>)> {
        let parsed = match op_name {
            "const" => {
                let attr = self.read_number()?;
                let ty = self.read_result_type()?;
                let attr = match (attr, ty.elem()) {
                    (ConstAttr::Int(v), Some(e)) if e.is_float() => ConstAttr::Float(v as f64),
                    (ConstAttr::Float(_), None) => {
                        return self.error("Float constant of index type");
                    }
                    (ConstAttr::Float(_), Some(e)) if e.is_integer() => {
                        return self.error("Float constant of integer type");
                    }
                    (attr, _) => attr,
                };
                (OpKind::Constant(attr), Vec::new(), Some(ty))
            }
            "addi" | "muli" | "interleave" => {
                let lhs = self.read_value()?;
                self.expect(',')?;
                let rhs = self.read_value()?;
                let ty = self.read_result_type()?;
                let kind = match op_name {
                    "addi" => OpKind::AddI,
                    "muli" => OpKind::MulI,
                    _ => OpKind::Interleave,
                };
                (kind, vec![lhs, rhs], Some(ty))
            }
            "cast" => {
                let src = self.read_value()?;
                (OpKind::Cast, vec![src], Some(self.read_result_type()?))
            }
            "alloca" => (OpKind::Alloca, Vec::new(), Some(self.read_result_type()?)),
            "tile_zero" => (OpKind::TileZero, Vec::new(), Some(self.read_result_type()?)),
            "read" => {
                let operands = self.read_access()?;
                let flags = self.read_flags()?;
                let kind = OpKind::Read {
                    masked: flags.contains(&"masked"),
                    packed: flags.contains(&"packed"),
                };
                (kind, operands, Some(self.read_result_type()?))
            }
            "write" => {
                let value = self.read_value()?;
                self.expect(',')?;
                let mut operands = vec![value];
                operands.extend(self.read_access()?);
                let flags = self.read_flags()?;
                (OpKind::Write { masked: flags.contains(&"masked") }, operands, None)
            }
            "extract" => {
                let src = self.read_value()?;
                self.expect('[')?;
                let pos = self.read_integer()?;
                self.expect(']')?;
                (OpKind::Extract { pos }, vec![src], Some(self.read_result_type()?))
            }
            "prefetch" => (OpKind::Prefetch, self.read_access()?, None),
            "tile_load" => {
                let operands = self.read_access()?;
                (OpKind::TileLoad, operands, Some(self.read_result_type()?))
            }
            "tile_store" => {
                let tile = self.read_value()?;
                self.expect(',')?;
                let mut operands = vec![tile];
                operands.extend(self.read_access()?);
                (OpKind::TileStore, operands, None)
            }
            "tile_mulf" | "tile_muli" | "dot" => {
                let a = self.read_value()?;
                self.expect(',')?;
                let b = self.read_value()?;
                self.expect(',')?;
                let c = self.read_value()?;
                let ty = self.read_result_type()?;
                let kind = match op_name {
                    "tile_mulf" => OpKind::TileMulF,
                    "tile_muli" => OpKind::TileMulI,
                    _ => OpKind::Dot,
                };
                (kind, vec![a, b, c], Some(ty))
            }
            "yield" => (OpKind::Yield, self.read_value_list()?, None),
            "return" => (OpKind::Return, self.read_value_list()?, None),
            other => return self.error(format!("Unknown operation '{}'", other)),
        };
        Ok(parsed)
    }

    /// `for %iv = %lb to %ub step %s iter(%a = %init : T, ...) { ... }`
    fn parse_for(&mut self, block: super::BlockId) -> IrResult<OpId> {
        let iv_name = self.read_value_name()?;
        self.expect('=')?;
        let lower = self.read_value()?;
        self.expect_keyword("to")?;
        let upper = self.read_value()?;
        self.expect_keyword("step")?;
        let step = self.read_value()?;

        let mut iter_names = Vec::new();
        let mut operands = vec![lower, upper, step];
        let mut types = Vec::new();
        let save = self.pos;
        if self.read_word() == "iter" {
            self.expect('(')?;
            loop {
                iter_names.push(self.read_value_name()?);
                self.expect('=')?;
                operands.push(self.read_value()?);
                types.push(self.read_result_type()?);
                if !self.try_read(',') {
                    break;
                }
            }
            self.expect(')')?;
        } else {
            self.pos = save;
        }

        let op = self.module.create_op(OpKind::For, operands, types.clone());
        let body = self.module.add_block(Some(op));
        self.module.op_mut(op).regions.push(body);
        let iv = self.module.add_block_arg(body, Type::Index);
        self.define(iv_name, iv)?;
        for (name, ty) in iter_names.into_iter().zip(types) {
            let arg = self.module.add_block_arg(body, ty);
            self.define(name, arg)?;
        }
        self.module.append_op(op, block);

        self.expect('{')?;
        self.parse_block_body(body)?;

        let terminated = self
            .module
            .block(body)
            .ops
            .last()
            .is_some_and(|&t| self.module.op(t).kind == OpKind::Yield);
        if !terminated {
            return self.error("Loop body must end with 'yield'");
        }
        Ok(op)
    }
}
