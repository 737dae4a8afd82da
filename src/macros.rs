#[macro_export]
macro_rules! name {
    ($name:expr) => {
        Name::from_str($name)?
    };
}

#[macro_export]
macro_rules! ns {
    ($name:expr, $target:expr) => {
        Record::from_rdata($name.parse()?, 300, RData::NS(rdata::NS($target.parse()?)))
    };
}

#[macro_export]
macro_rules! a {
    ($name:expr, $target:expr) => {
        Record::from_rdata($name.parse()?, 300, RData::A(rdata::A(($target.parse()?))))
    };
}

#[macro_export]
macro_rules! aaaa {
    ($name:expr, $target:expr) => {
        Record::from_rdata($name.parse()?, 300, RData::AAAA(rdata::AAAA(($target.parse()?))))
    };
}

#[macro_export]
macro_rules! cname {
    ($name:expr, $target:expr) => {
        Record::from_rdata($name.parse()?, 300, RData::CNAME(rdata::CNAME($target.parse()?)))
    };
}

#[macro_export]
macro_rules! soa {
    ($name:expr) => {
        Record::from_rdata(
            $name.parse()?,
            300,
            RData::SOA(rdata::SOA::new(
                $name.parse()?,
                format!("hostmaster.{}", $name).parse()?,
                1,
                7200,
                900,
                86400,
                300,
            )),
        )
    };
}

#[macro_export]
macro_rules! ds {
    ($name:expr, $tag:expr) => {
        Record::from_rdata(
            $name.parse()?,
            300,
            RData::DNSSEC(DNSSECRData::DS(DS::new(
                $tag,
                Algorithm::RSASHA256,
                DigestType::SHA256,
                vec![0u8; 32],
            ))),
        )
    };
}

#[macro_export]
macro_rules! nsec {
    ($name:expr) => {
        Record::from_rdata(
            $name.parse()?,
            300,
            RData::DNSSEC(DNSSECRData::NSEC(NSEC::new(
                $name.parse()?,
                vec![RecordType::NS, RecordType::SOA],
            ))),
        )
    };
}

#[macro_export]
macro_rules! rrsig {
    ($name:expr, $covered:expr) => {
        Record::from_rdata(
            $name.parse()?,
            300,
            RData::DNSSEC(DNSSECRData::RRSIG(RRSIG::new(
                $covered,
                Algorithm::RSASHA256,
                2,
                300,
                0,
                0,
                12345,
                $name.parse()?,
                vec![0u8; 64],
            ))),
        )
    };
}

#[macro_export]
macro_rules! refer {
    ($nameservers:expr) => {{
        let mut msg = Message::new();
        msg.insert_name_servers(vec![$nameservers]);
        msg
    }};
    ($nameservers:expr, $glue:expr) => {{
        let mut msg = Message::new();
        msg.insert_name_servers(vec![$nameservers]);
        msg.insert_additionals(vec![$glue]);
        msg
    }};
}

#[macro_export]
macro_rules! answer {
    ($($record:expr),+) => {{
        let mut msg = Message::new();
        let mut header = Header::default();
        header.set_authoritative(true);
        msg.set_header(header);
        msg.insert_answers(vec![$($record),+]);
        msg
    }};
}
