use hickory_proto::op::Query;
use hickory_proto::rr::{DNSClass, Name, RecordType};

/// The question being resolved, together with its QNAME-minimization
/// shadow. While a zone cut is tracked, the wire question is the
/// minimized name (one label below the cut) with a stand-in `NS` type;
/// once the minimized name reaches the full name the fallback
/// controller drops the stand-in and the real type goes out.
///
/// `Name` equality in hickory is case-insensitive, so comparisons here
/// follow suit; zone cuts are stored lower-case.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Question {
    pub name: Name,
    pub record_type: RecordType,
    pub query_class: DNSClass,
    zone_cut: Option<Name>,
    minimized_name: Option<Name>,
    minimized_type: Option<RecordType>,
}

impl Question {
    pub fn new(name: Name, record_type: RecordType) -> Self {
        Question {
            name,
            record_type,
            query_class: DNSClass::IN,
            zone_cut: None,
            minimized_name: None,
            minimized_type: None,
        }
    }

    pub fn from_query(query: &Query) -> Self {
        let mut question = Question::new(query.name().clone(), query.query_type());
        question.query_class = query.query_class();
        question
    }

    /// The full question as sent by the caller.
    pub fn to_query(&self) -> Query {
        let mut query = Query::new();
        query
            .set_name(self.name.clone())
            .set_query_type(self.record_type)
            .set_query_class(self.query_class);
        query
    }

    pub fn zone_cut(&self) -> Option<&Name> {
        self.zone_cut.as_ref()
    }

    pub fn minimized_name(&self) -> Option<&Name> {
        self.minimized_name.as_ref()
    }

    /// The name that actually goes on the wire.
    pub fn effective_name(&self) -> &Name {
        self.minimized_name.as_ref().unwrap_or(&self.name)
    }

    /// The type that actually goes on the wire.
    pub fn effective_type(&self) -> RecordType {
        self.minimized_type.unwrap_or(self.record_type)
    }

    /// True while the wire question still differs from the full question.
    pub fn is_minimized(&self) -> bool {
        self.zone_cut.is_some()
            && (self.effective_name() != &self.name
                || self.effective_type() != self.record_type)
    }

    /// Moves the minimization depth to `cut` and recomputes the wire
    /// question: reveal one more label of the full name below the cut,
    /// probing with `NS` until the full name itself is on the wire.
    /// Clearing the cut restores the full question.
    pub fn set_zone_cut(&mut self, cut: Option<Name>) {
        self.zone_cut = cut.map(|c| c.to_lowercase());
        match &self.zone_cut {
            None => {
                self.minimized_name = None;
                self.minimized_type = None;
            }
            Some(cut) => {
                let full = self.name.to_lowercase();
                let reveal = cut.num_labels() + 1;
                if !cut.zone_of(&full) || full.num_labels() <= reveal {
                    self.minimized_name = Some(full);
                    self.minimized_type = Some(RecordType::NS);
                } else {
                    let mut minimized = full;
                    while minimized.num_labels() > reveal {
                        minimized = minimized.base_name();
                    }
                    self.minimized_name = Some(minimized);
                    self.minimized_type = Some(RecordType::NS);
                }
            }
        }
    }

    /// Drops the stand-in type so the next query asks the real question,
    /// keeping the cut for bookkeeping.
    pub fn clear_minimization(&mut self) {
        self.zone_cut = None;
        self.minimized_name = None;
        self.minimized_type = None;
    }
}

impl std::fmt::Display for Question {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {} {}", self.name, self.query_class, self.record_type)
    }
}

#[cfg(test)]
mod tests {
    use super::Question;
    use anyhow::Result;
    use hickory_proto::rr::{Name, RecordType};
    use std::str::FromStr;

    fn question(name: &str) -> Result<Question> {
        Ok(Question::new(Name::from_str(name)?, RecordType::A))
    }

    #[test]
    fn test_unminimized_by_default() -> Result<()> {
        let q = question("www.example.com.")?;
        assert!(!q.is_minimized());
        assert_eq!(&q.name, q.effective_name());
        assert_eq!(RecordType::A, q.effective_type());
        Ok(())
    }

    #[test]
    fn test_reveal_one_label_below_cut() -> Result<()> {
        let mut q = question("www.example.com.")?;
        q.set_zone_cut(Some(Name::root()));
        assert_eq!(&Name::from_str("com.")?, q.effective_name());
        assert_eq!(RecordType::NS, q.effective_type());
        assert!(q.is_minimized());

        q.set_zone_cut(Some(Name::from_str("com.")?));
        assert_eq!(&Name::from_str("example.com.")?, q.effective_name());
        assert_eq!(RecordType::NS, q.effective_type());
        Ok(())
    }

    #[test]
    fn test_full_name_keeps_standin_type() -> Result<()> {
        let mut q = question("www.example.com.")?;
        q.set_zone_cut(Some(Name::from_str("example.com.")?));
        assert_eq!(&q.name.to_lowercase(), q.effective_name());
        assert_eq!(RecordType::NS, q.effective_type());
        // name agrees but the type does not, so it still counts as minimized
        assert!(q.is_minimized());
        Ok(())
    }

    #[test]
    fn test_clearing_restores_full_question() -> Result<()> {
        let mut q = question("www.example.com.")?;
        q.set_zone_cut(Some(Name::root()));
        q.set_zone_cut(None);
        assert!(!q.is_minimized());
        assert_eq!(&q.name, q.effective_name());
        assert_eq!(RecordType::A, q.effective_type());
        Ok(())
    }

    #[test]
    fn test_cut_is_lowercased() -> Result<()> {
        let mut q = question("www.Example.COM.")?;
        q.set_zone_cut(Some(Name::from_str("Example.COM.")?));
        assert_eq!(Some(&Name::from_str("example.com.")?), q.zone_cut());
        Ok(())
    }

    #[test]
    fn test_cut_outside_name_falls_back_to_full() -> Result<()> {
        let mut q = question("www.example.com.")?;
        q.set_zone_cut(Some(Name::from_str("example.net.")?));
        assert_eq!(&q.name.to_lowercase(), q.effective_name());
        Ok(())
    }
}
