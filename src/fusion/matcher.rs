//! Listener matchers.
//!
//! A `Matcher` is an AND-list of `MatchRule`s evaluated by a pure function
//! against a fused advertisement. An empty matcher accepts everything.

use std::fmt;

use bluer::Address;
use regex::Regex;
use smallvec::SmallVec;
use uuid::Uuid;

use crate::{
   advertisement::Advertisement,
   error::{FusionError, Result},
};

/// Minimum number of literal characters before the first wildcard.
const LOCAL_NAME_MIN_MATCH_LENGTH: usize = 3;

const GLOB_WILDCARDS: &[char] = &['*', '?', '['];

/// A compiled local-name glob (`*`, `?` and `[...]` classes).
#[derive(Clone)]
pub struct NamePattern {
   glob: String,
   regex: Regex,
}

impl NamePattern {
   /// Compiles `glob`, rejecting patterns that would match too many devices.
   pub fn new(glob: &str) -> Result<Self> {
      let literal_prefix = glob.find(GLOB_WILDCARDS).unwrap_or(glob.len());
      if glob[..literal_prefix].chars().count() < LOCAL_NAME_MIN_MATCH_LENGTH {
         return Err(FusionError::InvalidMatcher(format!(
            "local name pattern {glob:?} is too broad; at least \
             {LOCAL_NAME_MIN_MATCH_LENGTH} characters are required before a wildcard"
         )));
      }
      let regex = Regex::new(&glob_to_regex(glob))
         .map_err(|e| FusionError::InvalidMatcher(format!("local name pattern {glob:?}: {e}")))?;
      Ok(Self {
         glob: glob.to_owned(),
         regex,
      })
   }

   pub fn as_str(&self) -> &str {
      &self.glob
   }

   pub fn is_match(&self, name: &str) -> bool {
      self.regex.is_match(name)
   }
}

impl fmt::Debug for NamePattern {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      f.debug_tuple("NamePattern").field(&self.glob).finish()
   }
}

impl PartialEq for NamePattern {
   fn eq(&self, other: &Self) -> bool {
      self.glob == other.glob
   }
}

fn glob_to_regex(glob: &str) -> String {
   let mut out = String::with_capacity(glob.len() * 2 + 2);
   out.push('^');
   let mut chars = glob.chars().peekable();
   while let Some(c) = chars.next() {
      match c {
         '*' => out.push_str(".*"),
         '?' => out.push('.'),
         '[' => {
            // Unterminated classes are literal brackets.
            let class: String = chars.clone().take_while(|&c| c != ']').collect();
            if chars.clone().nth(class.chars().count()) == Some(']') {
               out.push('[');
               let body = class.strip_prefix('!').map_or_else(
                  || class.clone(),
                  |rest| format!("^{rest}"),
               );
               out.push_str(&body.replace('\\', "\\\\"));
               out.push(']');
               for _ in 0..=class.chars().count() {
                  chars.next();
               }
            } else {
               out.push_str("\\[");
            }
         },
         c => out.push_str(&regex::escape(c.encode_utf8(&mut [0; 4]))),
      }
   }
   out.push('$');
   out
}

/// One predicate of a matcher.
#[derive(Debug, Clone, PartialEq)]
pub enum MatchRule {
   Address(Address),
   /// `true` restricts the listener to the connectable class; `false`
   /// accepts either class.
   Connectable(bool),
   ServiceUuid(Uuid),
   ServiceDataUuid(Uuid),
   ManufacturerId(u16),
   /// Manufacturer payload prefix, checked against the ids named by
   /// `ManufacturerId` rules (or every payload when there are none).
   ManufacturerDataStart(SmallVec<[u8; 8]>),
   LocalName(NamePattern),
}

/// AND-combination of rules.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Matcher {
   rules: SmallVec<[MatchRule; 4]>,
}

impl Matcher {
   /// A matcher that accepts every advertisement.
   pub fn any() -> Self {
      Self::default()
   }

   pub fn address(address: Address) -> Self {
      Self::any().and(MatchRule::Address(address))
   }

   pub fn and(mut self, rule: MatchRule) -> Self {
      self.rules.push(rule);
      self
   }

   pub fn connectable(self, connectable: bool) -> Self {
      self.and(MatchRule::Connectable(connectable))
   }

   pub fn service_uuid(self, uuid: Uuid) -> Self {
      self.and(MatchRule::ServiceUuid(uuid))
   }

   pub fn service_data_uuid(self, uuid: Uuid) -> Self {
      self.and(MatchRule::ServiceDataUuid(uuid))
   }

   pub fn manufacturer_id(self, id: u16) -> Self {
      self.and(MatchRule::ManufacturerId(id))
   }

   pub fn manufacturer_data_start(self, prefix: &[u8]) -> Self {
      self.and(MatchRule::ManufacturerDataStart(SmallVec::from_slice(prefix)))
   }

   pub fn local_name(self, glob: &str) -> Result<Self> {
      Ok(self.and(MatchRule::LocalName(NamePattern::new(glob)?)))
   }

   pub fn rules(&self) -> &[MatchRule] {
      &self.rules
   }

   /// Address the matcher is pinned to, if any.
   pub fn address_filter(&self) -> Option<Address> {
      self.rules.iter().find_map(|rule| match rule {
         MatchRule::Address(address) => Some(*address),
         _ => None,
      })
   }

   /// Whether the listener only wants views from connectable scanners.
   pub fn requires_connectable(&self) -> bool {
      self
         .rules
         .iter()
         .any(|rule| matches!(rule, MatchRule::Connectable(true)))
   }

   /// Evaluates all rules against `adv`.
   pub fn matches(&self, adv: &Advertisement) -> bool {
      self.rules.iter().all(|rule| self.rule_matches(rule, adv))
   }

   fn rule_matches(&self, rule: &MatchRule, adv: &Advertisement) -> bool {
      match rule {
         MatchRule::Address(address) => adv.address == *address,
         MatchRule::Connectable(required) => !required || adv.connectable,
         MatchRule::ServiceUuid(uuid) => adv.service_uuids.contains(uuid),
         MatchRule::ServiceDataUuid(uuid) => adv.service_data.contains_key(uuid),
         MatchRule::ManufacturerId(id) => adv.manufacturer_data.contains_key(id),
         MatchRule::ManufacturerDataStart(prefix) => {
            let mut ids = self.rules.iter().filter_map(|rule| match rule {
               MatchRule::ManufacturerId(id) => Some(*id),
               _ => None,
            });
            if let Some(first) = ids.next() {
               std::iter::once(first)
                  .chain(ids)
                  .filter_map(|id| adv.manufacturer_data.get(&id))
                  .any(|data| data.starts_with(prefix))
            } else {
               adv
                  .manufacturer_data
                  .values()
                  .any(|data| data.starts_with(prefix))
            }
         },
         MatchRule::LocalName(pattern) => adv.name.as_deref().is_some_and(|n| pattern.is_match(n)),
      }
   }
}
