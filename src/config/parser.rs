//! Block handlers, driven by an explicit parser context.

use super::lexer::Item;
use super::{Diagnostic, Error};
use crate::checker::{CheckerId, ProbeCheck, ProbeKind};
use crate::graph::Graph;
use crate::link::LinkId;
use crate::server::{Protocol, RsId, ServerKey, ServiceKey, VsId};
use crate::track::{self, FileId, InitFile};
use crate::MAX_WEIGHT;

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use tracing::{event, Level};

// A block which is open while parsing.
#[derive(Copy, Clone, Debug)]
enum Block {
    TrackFile(FileId),
    VirtualServer(VsId),
    RealServer(RsId),
    FileCheck { link: LinkId, named: bool },
    Probe(CheckerId),
    // A block nested within a probe, recorded verbatim.
    ProbeNested(CheckerId),
    // A block whose content is ignored.
    Skip,
}

/// Holds the graph being built, and the blocks currently open.
pub(crate) struct ParserContext {
    graph: Graph,
    diagnostics: Vec<Diagnostic>,
    blocks: Vec<Block>,
    line: usize,
}

impl ParserContext {
    pub(crate) fn new() -> Self {
        Self {
            graph: Graph::new(),
            diagnostics: vec![],
            blocks: vec![],
            line: 0,
        }
    }

    pub(crate) fn run(mut self, items: Vec<Item>) -> (Graph, Vec<Diagnostic>) {
        let mut items = items.into_iter().peekable();
        while let Some(item) = items.next() {
            self.line = item.line();
            match item {
                Item::Statement { words, .. } => {
                    if matches!(items.peek(), Some(Item::Open { .. })) {
                        items.next();
                        let block = self.open_block(&words);
                        self.blocks.push(block);
                    } else {
                        self.directive(&words);
                    }
                }
                Item::Open { .. } => {
                    self.report(Error::MisplacedDirective("{".to_string()));
                    self.blocks.push(Block::Skip);
                }
                Item::Close { .. } => match self.blocks.pop() {
                    Some(block) => self.close_block(block),
                    None => self.report(Error::UnbalancedBlock),
                },
            }
        }

        if !self.blocks.is_empty() {
            self.report(Error::UnbalancedBlock);
            while let Some(block) = self.blocks.pop() {
                self.close_block(block);
            }
        }
        (self.graph, self.diagnostics)
    }

    fn report(&mut self, error: Error) {
        event!(Level::WARN, line = self.line, %error, "Configuration error");
        self.diagnostics.push(Diagnostic {
            line: self.line,
            error,
        });
    }

    fn open_block(&mut self, words: &[String]) -> Block {
        let keyword = words[0].as_str();
        match (self.blocks.last().copied(), keyword) {
            (None, "track_file") => self.track_file_block(words),
            (None, "virtual_server") => self.virtual_server_block(words),
            (None, _) => {
                // Sections for other parts of the daemon.
                event!(Level::DEBUG, keyword, "Skipping block");
                Block::Skip
            }
            (Some(Block::VirtualServer(vs)), "real_server") => self.real_server_block(vs, words),
            (Some(Block::RealServer(rs)), "FILE_CHECK") => Block::FileCheck {
                link: self.graph.add_link(rs),
                named: false,
            },
            (Some(Block::RealServer(rs)), _) => match ProbeKind::from_keyword(keyword) {
                Some(kind) => Block::Probe(self.graph.add_probe(rs, ProbeCheck::new(kind))),
                None => {
                    self.report(Error::UnknownKeyword(keyword.to_string()));
                    Block::Skip
                }
            },
            (Some(Block::Probe(checker) | Block::ProbeNested(checker)), _) => {
                let mut directive = words.to_vec();
                directive.push("{".to_string());
                self.record_probe_directive(checker, directive);
                Block::ProbeNested(checker)
            }
            (Some(Block::Skip), _) => Block::Skip,
            (Some(_), _) => {
                self.report(Error::UnknownKeyword(keyword.to_string()));
                Block::Skip
            }
        }
    }

    fn close_block(&mut self, block: Block) {
        match block {
            Block::TrackFile(file) => self.track_file_end(file),
            Block::FileCheck { link, named } => self.file_check_end(link, named),
            Block::ProbeNested(checker) => {
                self.record_probe_directive(checker, vec!["}".to_string()])
            }
            Block::VirtualServer(_) | Block::RealServer(_) | Block::Probe(_) | Block::Skip => (),
        }
    }

    fn directive(&mut self, words: &[String]) {
        let keyword = words[0].as_str();
        match self.blocks.last().copied() {
            None => match keyword {
                "track_file" | "virtual_server" => {
                    self.report(Error::MisplacedDirective(keyword.to_string()))
                }
                _ => self.report(Error::UnknownKeyword(keyword.to_string())),
            },
            Some(Block::TrackFile(file)) => self.track_file_directive(file, words),
            Some(Block::VirtualServer(vs)) => self.virtual_server_directive(vs, words),
            Some(Block::RealServer(rs)) => self.real_server_directive(rs, words),
            Some(Block::FileCheck { link, .. }) => self.file_check_directive(link, words),
            Some(Block::Probe(checker) | Block::ProbeNested(checker)) => {
                self.record_probe_directive(checker, words.to_vec())
            }
            Some(Block::Skip) => (),
        }
    }

    // track_file <name> { ... }

    fn track_file_block(&mut self, words: &[String]) -> Block {
        let Some(name) = words.get(1) else {
            self.report(Error::MissingArgument("track_file".to_string()));
            return Block::Skip;
        };
        match self.graph.files_mut().register(name.as_str(), PathBuf::new()) {
            Ok(file) => Block::TrackFile(file),
            Err(track::Error::DuplicateName(name)) => {
                self.report(Error::DuplicateResource(name.to_string()));
                Block::Skip
            }
        }
    }

    fn track_file_directive(&mut self, file: FileId, words: &[String]) {
        match words[0].as_str() {
            "file" => {
                let Some(path) = words.get(1) else {
                    self.report(Error::MissingArgument("file".to_string()));
                    return;
                };
                self.graph.files_mut()[file].path = PathBuf::from(path);
            }
            "weight" => {
                if let Some((weight, reverse)) = self.weight(words) {
                    let tracked = &mut self.graph.files_mut()[file];
                    tracked.weight = weight;
                    tracked.weight_reverse = reverse;
                }
            }
            "init_file" => {
                if let Some(init) = self.init_file(words) {
                    self.graph.files_mut()[file].init = Some(init);
                }
            }
            keyword => self.report(Error::UnknownKeyword(keyword.to_string())),
        }
    }

    // init_file [VALUE] [overwrite]
    fn init_file(&mut self, words: &[String]) -> Option<InitFile> {
        let mut init = InitFile::default();
        let mut args = words[1..].iter().peekable();
        if let Some(value) = args.next_if(|arg| arg.as_str() != "overwrite") {
            let Ok(value) = value.parse::<i64>() else {
                self.report(Error::InvalidNumber(value.clone()));
                return None;
            };
            init.value = value;
        }
        match args.next().map(String::as_str) {
            None => (),
            Some("overwrite") => init.overwrite = true,
            Some(other) => {
                self.report(Error::UnknownOption(other.to_string()));
                return None;
            }
        }
        Some(init)
    }

    fn track_file_end(&mut self, file: FileId) {
        let tracked = &self.graph.files()[file];
        if tracked.path.as_os_str().is_empty() {
            let name = tracked.name.to_string();
            self.report(Error::MissingPath(name));
            self.graph.files_mut().unregister(file);
        }
    }

    // virtual_server <addr> <port> | fwmark <mark> | group <name> { ... }

    fn virtual_server_block(&mut self, words: &[String]) -> Block {
        let key = match words.get(1).map(String::as_str) {
            None => Err(Error::MissingArgument("virtual_server".to_string())),
            Some("fwmark") => match words.get(2) {
                None => Err(Error::MissingArgument("fwmark".to_string())),
                Some(mark) => mark
                    .parse::<u32>()
                    .map(ServiceKey::Fwmark)
                    .map_err(|_| Error::InvalidNumber(mark.clone())),
            },
            Some("group") => match words.get(2) {
                None => Err(Error::MissingArgument("group".to_string())),
                Some(name) => Ok(ServiceKey::Group(name.clone())),
            },
            Some(_) => parse_address(&words[1..]).map(|address| ServiceKey::Address {
                address,
                protocol: Protocol::default(),
            }),
        };
        let key = match key {
            Ok(key) => key,
            Err(error) => {
                self.report(error);
                return Block::Skip;
            }
        };
        if self.graph.find_service(&key).is_some() {
            self.report(Error::DuplicateServer(format!("virtual_server {key}")));
            return Block::Skip;
        }
        Block::VirtualServer(self.graph.add_service(key))
    }

    fn virtual_server_directive(&mut self, vs: VsId, words: &[String]) {
        match words[0].as_str() {
            "protocol" => {
                let Some(keyword) = words.get(1) else {
                    self.report(Error::MissingArgument("protocol".to_string()));
                    return;
                };
                let Some(new) = Protocol::from_keyword(keyword) else {
                    self.report(Error::UnknownOption(keyword.clone()));
                    return;
                };
                let updated = match &mut self.graph.service_mut(vs).key {
                    ServiceKey::Address { protocol, .. } => {
                        *protocol = new;
                        true
                    }
                    _ => false,
                };
                if !updated {
                    self.report(Error::MisplacedDirective("protocol".to_string()));
                }
            }
            // Scheduling and persistence belong to the table collaborator.
            keyword => event!(Level::DEBUG, keyword, "Ignoring virtual_server keyword"),
        }
    }

    // real_server <addr> <port> { ... }

    fn real_server_block(&mut self, vs: VsId, words: &[String]) -> Block {
        let address = match parse_address(&words[1..]) {
            Ok(address) => address,
            Err(error) => {
                self.report(error);
                return Block::Skip;
            }
        };
        let key = ServerKey::new(address);
        let service = self.graph.service(vs).key.clone();
        if self.graph.find_server(&service, &key).is_some() {
            self.report(Error::DuplicateServer(format!("real_server {key}")));
            return Block::Skip;
        }
        Block::RealServer(self.graph.add_server(vs, key))
    }

    fn real_server_directive(&mut self, rs: RsId, words: &[String]) {
        match words[0].as_str() {
            "weight" => {
                let Some(value) = words.get(1) else {
                    self.report(Error::MissingArgument("weight".to_string()));
                    return;
                };
                let Ok(weight) = value.parse::<i64>() else {
                    self.report(Error::InvalidNumber(value.clone()));
                    return;
                };
                if !(0..=MAX_WEIGHT).contains(&weight) {
                    self.report(Error::WeightOutOfRange {
                        value: weight,
                        min: 0,
                        max: MAX_WEIGHT,
                    });
                    return;
                }
                self.graph.server_mut(rs).weight = weight;
            }
            keyword => event!(Level::DEBUG, keyword, "Ignoring real_server keyword"),
        }
    }

    // FILE_CHECK { track_file <name>; weight <int> [reverse|noreverse] }

    fn file_check_directive(&mut self, link: LinkId, words: &[String]) {
        match words[0].as_str() {
            "track_file" => {
                let Some(name) = words.get(1) else {
                    self.report(Error::MissingArgument("track_file".to_string()));
                    return;
                };
                if let Some(Block::FileCheck { named, .. }) = self.blocks.last_mut() {
                    *named = true;
                }
                match self.graph.files().resolve(name) {
                    Some(file) => self.graph.set_link_file(link, file),
                    None => self.report(Error::UnresolvedResource(name.clone())),
                }
            }
            "weight" => {
                if let Some((weight, reverse)) = self.weight(words) {
                    let tracking = self.graph.link_mut(link);
                    tracking.weight = weight;
                    tracking.weight_reverse = reverse;
                }
            }
            keyword => self.report(Error::UnknownKeyword(keyword.to_string())),
        }
    }

    fn file_check_end(&mut self, link: LinkId, named: bool) {
        if self.graph.link(link).file().is_some() {
            self.graph.inherit_link_policy(link);
            return;
        }
        // An unresolved name was reported already.
        if !named {
            self.report(Error::MissingResource);
        }
        self.graph.remove_link(link);
    }

    fn record_probe_directive(&mut self, checker: CheckerId, directive: Vec<String>) {
        if let Some(probe) = self.graph.probe_mut(checker) {
            probe.directives.push(directive);
        }
    }

    // weight <int> [reverse|noreverse]
    fn weight(&mut self, words: &[String]) -> Option<(i64, bool)> {
        let Some(value) = words.get(1) else {
            self.report(Error::MissingArgument(words[0].clone()));
            return None;
        };
        let Ok(weight) = value.parse::<i64>() else {
            self.report(Error::InvalidNumber(value.clone()));
            return None;
        };
        if !(-MAX_WEIGHT..=MAX_WEIGHT).contains(&weight) {
            self.report(Error::WeightOutOfRange {
                value: weight,
                min: -MAX_WEIGHT,
                max: MAX_WEIGHT,
            });
            return None;
        }
        let reverse = match words.get(2).map(String::as_str) {
            None | Some("noreverse") => false,
            Some("reverse") => true,
            Some(other) => {
                self.report(Error::UnknownOption(other.to_string()));
                return None;
            }
        };
        Some((weight, reverse))
    }
}

// <ip> <port>
fn parse_address(words: &[String]) -> Result<SocketAddr, Error> {
    let Some(ip) = words.first() else {
        return Err(Error::MissingArgument("address".to_string()));
    };
    let ip: IpAddr = ip
        .parse()
        .map_err(|_| Error::InvalidAddress(ip.clone()))?;
    let Some(port) = words.get(1) else {
        return Err(Error::MissingArgument("port".to_string()));
    };
    let port: u16 = port
        .parse()
        .map_err(|_| Error::InvalidNumber(port.clone()))?;
    Ok(SocketAddr::new(ip, port))
}
