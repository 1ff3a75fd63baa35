use ipnet::IpNet;

/// Matches a client's source network.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct NetworkMatch {
    /// A network to match against.
    pub net: IpNet,

    /// Networks to exclude from the match.
    pub except: Vec<IpNet>,
}

// === impl NetworkMatch ===

impl From<IpNet> for NetworkMatch {
    fn from(net: IpNet) -> Self {
        Self {
            net,
            except: vec![],
        }
    }
}
