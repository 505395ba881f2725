//! Dynamic-update back-end: standard DNS UPDATE over TCP, signed with TSIG.
//!
//! Each update deletes everything at the FQDN and adds the desired records,
//! which makes the operation idempotent on the server side. Errors are
//! reported to the publisher; the next driver cycle re-issues the same
//! update because the suppression cache only advances on success.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use hickory_client::client::{Client, ClientHandle};
use hickory_proto::dnssec::rdata::tsig::TsigAlgorithm;
use hickory_proto::dnssec::tsig::TSigner;
use hickory_proto::op::ResponseCode;
use hickory_proto::rr::rdata::{A, AAAA, CNAME};
use hickory_proto::rr::{DNSClass, Name, RData, RecordSet, RecordType};
use hickory_proto::runtime::TokioRuntimeProvider;
use hickory_proto::tcp::TcpClientStream;
use hickory_proto::xfer::DnsResponse;

use super::{DnsBackend, DnsRecords};

/// Key name the name server expects our HMAC-SHA256 signatures under.
pub const TSIG_KEY_NAME: &str = "aprs2net-dns.";

const DNS_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_DNS_PORT: u16 = 53;
const TSIG_FUDGE: u16 = 300;

pub struct BindBackend {
    master: SocketAddr,
    key: Vec<u8>,
}

impl BindBackend {
    pub fn new(master: &str, tsig_key_base64: &str) -> anyhow::Result<Self> {
        let key = BASE64
            .decode(tsig_key_base64.trim())
            .context("dns_tsig_key is not valid base64")?;

        Ok(Self {
            master: parse_master(master)?,
            key,
        })
    }

    async fn connect(&self) -> anyhow::Result<Client> {
        let signer = TSigner::new(
            self.key.clone(),
            TsigAlgorithm::HmacSha256,
            Name::from_ascii(TSIG_KEY_NAME)?,
            TSIG_FUDGE,
        )?;

        let (stream, sender) = TcpClientStream::new(
            self.master,
            None,
            Some(DNS_TIMEOUT),
            TokioRuntimeProvider::new(),
        );
        let (client, bg) = Client::new(stream, sender, Some(Arc::new(signer)))
            .await
            .context("cannot connect to DNS master")?;

        tokio::spawn(bg);

        Ok(client)
    }
}

#[async_trait]
impl DnsBackend for BindBackend {
    fn name(&self) -> &'static str {
        "dynamic-update"
    }

    async fn publish(
        &self,
        zone: &str,
        fqdn: &str,
        records: &DnsRecords,
        ttl: u32,
    ) -> anyhow::Result<()> {
        // Trailing dots keep the server from appending the zone name again.
        let name = Name::from_ascii(format!("{fqdn}."))?;
        let origin = Name::from_ascii(format!("{zone}."))?;

        let mut client = self.connect().await?;

        let response = client
            .delete_all(name.clone(), origin.clone(), DNSClass::IN)
            .await
            .context("delete of existing records failed")?;
        check_response("delete", &response)?;

        for rrset in record_sets(&name, records, ttl)? {
            let response = client
                .append(rrset, origin.clone(), false)
                .await
                .context("record add failed")?;
            check_response("add", &response)?;
        }

        Ok(())
    }
}

fn record_sets(name: &Name, records: &DnsRecords, ttl: u32) -> anyhow::Result<Vec<RecordSet>> {
    let mut sets = Vec::new();

    match records {
        DnsRecords::Cname(target) => {
            let mut rrset = RecordSet::with_ttl(name.clone(), RecordType::CNAME, ttl);
            rrset.add_rdata(RData::CNAME(CNAME(Name::from_ascii(format!("{target}."))?)));
            sets.push(rrset);
        }
        DnsRecords::Addresses { v4, v6 } => {
            if !v4.is_empty() {
                let mut rrset = RecordSet::with_ttl(name.clone(), RecordType::A, ttl);
                for addr in v4 {
                    let ip: std::net::Ipv4Addr =
                        addr.parse().with_context(|| format!("bad A record {addr}"))?;
                    rrset.add_rdata(RData::A(A::from(ip)));
                }
                sets.push(rrset);
            }

            if !v6.is_empty() {
                let mut rrset = RecordSet::with_ttl(name.clone(), RecordType::AAAA, ttl);
                for addr in v6 {
                    let ip: std::net::Ipv6Addr = addr
                        .parse()
                        .with_context(|| format!("bad AAAA record {addr}"))?;
                    rrset.add_rdata(RData::AAAA(AAAA::from(ip)));
                }
                sets.push(rrset);
            }
        }
    }

    Ok(sets)
}

fn check_response(op: &str, response: &DnsResponse) -> anyhow::Result<()> {
    if response.response_code() != ResponseCode::NoError {
        bail!("DNS master answered {op} with {}", response.response_code());
    }

    Ok(())
}

/// The master is given as an IP literal, optionally with a port.
fn parse_master(master: &str) -> anyhow::Result<SocketAddr> {
    if let Ok(addr) = master.parse::<SocketAddr>() {
        return Ok(addr);
    }
    if let Ok(ip) = master.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, DEFAULT_DNS_PORT));
    }

    bail!("dns_master '{master}' is not an IP address or IP:port");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn master_address_accepts_ip_and_ip_port() {
        assert_eq!(
            parse_master("192.0.2.53").unwrap(),
            "192.0.2.53:53".parse().unwrap()
        );
        assert_eq!(
            parse_master("192.0.2.53:5353").unwrap(),
            "192.0.2.53:5353".parse().unwrap()
        );
        assert_eq!(
            parse_master("[2001:db8::53]:53").unwrap(),
            "[2001:db8::53]:53".parse().unwrap()
        );
        assert!(parse_master("ns.example.com").is_err());
    }

    #[test]
    fn cname_yields_a_single_record_set() {
        let name = Name::from_ascii("finland.aprs2.net.").unwrap();
        let sets = record_sets(&name, &DnsRecords::cname("rotate.aprs2.net"), 600).unwrap();

        assert_eq!(sets.len(), 1);
        assert_eq!(sets[0].record_type(), RecordType::CNAME);
        assert_eq!(sets[0].ttl(), 600);
    }

    #[test]
    fn addresses_yield_a_and_aaaa_sets() {
        let name = Name::from_ascii("rotate.aprs2.net.").unwrap();
        let sets = record_sets(
            &name,
            &DnsRecords::Addresses {
                v4: vec!["192.0.2.1".to_owned(), "192.0.2.2".to_owned()],
                v6: vec!["2001:db8::1".to_owned()],
            },
            600,
        )
        .unwrap();

        assert_eq!(sets.len(), 2);
        assert_eq!(sets[0].record_type(), RecordType::A);
        assert_eq!(sets[0].records_without_rrsigs().count(), 2);
        assert_eq!(sets[1].record_type(), RecordType::AAAA);
    }

    #[test]
    fn bad_address_is_rejected() {
        let name = Name::from_ascii("rotate.aprs2.net.").unwrap();
        let result = record_sets(
            &name,
            &DnsRecords::Addresses {
                v4: vec!["not-an-ip".to_owned()],
                v6: vec![],
            },
            600,
        );

        assert!(result.is_err());
    }
}
