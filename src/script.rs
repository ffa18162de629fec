use anyhow::{anyhow, Result};
use log::warn;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;

// --- Voices ---

/// Fixed voice identifiers supported by the realtime speech backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Voice {
    Alloy,
    Ash,
    Ballad,
    Coral,
    Echo,
    Nova,
    #[default]
    Sage,
    Shimmer,
    Verse,
}

impl Voice {
    pub fn as_str(&self) -> &'static str {
        match self {
            Voice::Alloy => "alloy",
            Voice::Ash => "ash",
            Voice::Ballad => "ballad",
            Voice::Coral => "coral",
            Voice::Echo => "echo",
            Voice::Nova => "nova",
            Voice::Sage => "sage",
            Voice::Shimmer => "shimmer",
            Voice::Verse => "verse",
        }
    }
}

impl FromStr for Voice {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "alloy" => Ok(Voice::Alloy),
            "ash" => Ok(Voice::Ash),
            "ballad" => Ok(Voice::Ballad),
            "coral" => Ok(Voice::Coral),
            "echo" => Ok(Voice::Echo),
            "nova" => Ok(Voice::Nova),
            "sage" => Ok(Voice::Sage),
            "shimmer" => Ok(Voice::Shimmer),
            "verse" => Ok(Voice::Verse),
            other => Err(anyhow!("unknown voice: {}", other)),
        }
    }
}

// --- Characters ---

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Personality {
    #[serde(rename = "trait")]
    pub trait_: String,
    pub goal: String,
    pub speech_style: String,
}

impl Personality {
    /// Fallback used when a character block carries malformed personality
    /// JSON. The block is kept rather than dropped.
    pub fn fallback() -> Self {
        Self {
            trait_: "friendly".to_string(),
            goal: "help tell the story".to_string(),
            speech_style: "clear and warm".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Character {
    pub name: String,
    pub prompt: String,
    pub voice: Voice,
    pub personality: Personality,
}

// --- Story events ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Narrate,
    Speak,
    Input,
}

impl EventKind {
    fn id_tag(&self) -> &'static str {
        match self {
            EventKind::Narrate => "narrate",
            EventKind::Speak => "speak",
            EventKind::Input => "input",
        }
    }
}

/// One narrative beat of a scene. `speak` always carries a resolved
/// character; `narrate` carries the implicit Narrator when one is defined;
/// `input` never synthesizes audio.
#[derive(Debug, Clone)]
pub struct StoryEvent {
    pub id: String,
    pub kind: EventKind,
    pub character: Option<Arc<Character>>,
    pub text: String,
    pub emotion: Option<String>,
    pub order: usize,
}

#[derive(Debug, Clone, Default)]
pub struct ParsedScene {
    pub id: String,
    pub name: String,
    /// Image-generation prompt for the scene illustration.
    pub prompt: String,
    pub mood: String,
    pub time: String,
    pub image_url: String,
    pub events: Vec<StoryEvent>,
}

// --- Structured scene payload (story backend shape) ---

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SceneDoc {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub prompt: String,
    #[serde(default)]
    pub mood: String,
    #[serde(default)]
    pub time: String,
    #[serde(default, rename = "imageUrl")]
    pub image_url: String,
    #[serde(default)]
    pub events: Vec<EventDoc>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EventDoc {
    #[serde(rename = "type")]
    pub kind: EventKind,
    /// Only the name is honored; the body is re-resolved against the parsed
    /// character mapping so stale character data cannot leak in.
    #[serde(default)]
    pub character: Option<CharacterRef>,
    #[serde(default, alias = "text")]
    pub content: String,
    #[serde(default)]
    pub emotion: Option<String>,
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub order: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CharacterRef {
    pub name: String,
}

// --- Parser ---

const CHARACTER_MARKER: &str = "@character:";
const NARRATOR: &str = "Narrator";

pub struct SceneParser {
    characters: HashMap<String, Arc<Character>>,
}

impl SceneParser {
    /// Builds a parser from a character-definition document. Malformed
    /// blocks are skipped with a warning; they never fail the whole parse.
    pub fn new(characters_doc: &str) -> Self {
        Self {
            characters: parse_characters(characters_doc),
        }
    }

    /// Builds a parser from already-typed characters (story backend path).
    pub fn from_characters(characters: Vec<Character>) -> Self {
        let characters = characters
            .into_iter()
            .map(|c| (c.name.clone(), Arc::new(c)))
            .collect();
        Self { characters }
    }

    pub fn character(&self, name: &str) -> Option<Arc<Character>> {
        self.characters.get(name).cloned()
    }

    pub fn characters(&self) -> &HashMap<String, Arc<Character>> {
        &self.characters
    }

    /// Parses the textual scene markup: `@scene:`, `@id:`, `@narrate`,
    /// `@speak:<name>`, `@input`, each optionally followed by an
    /// `[emotion: ...]` line and then a quoted text line. Blank lines and
    /// `#` comments are skipped. A scene with no recognized events yields an
    /// empty event list.
    pub fn parse_scene(&self, doc: &str) -> ParsedScene {
        let lines: Vec<&str> = doc
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty() && !l.starts_with('#'))
            .collect();

        let mut scene = ParsedScene::default();
        let mut i = 0;
        while i < lines.len() {
            let line = lines[i];
            if let Some(name) = line.strip_prefix("@scene:") {
                scene.name = name.trim().to_string();
            } else if let Some(id) = line.strip_prefix("@id:") {
                scene.id = id.trim().to_string();
            } else if line.starts_with("@narrate") {
                i = self.push_event(&mut scene, EventKind::Narrate, None, &lines, i);
                continue;
            } else if let Some(name) = line.strip_prefix("@speak:") {
                let name = name.trim().to_string();
                i = self.push_event(&mut scene, EventKind::Speak, Some(name), &lines, i);
                continue;
            } else if line.starts_with("@input") {
                i = self.push_event(&mut scene, EventKind::Input, None, &lines, i);
                continue;
            }
            i += 1;
        }
        scene
    }

    /// Consumes the optional emotion tag and the quoted text line following a
    /// marker at `lines[at]`, appending the event if it is well formed.
    /// Returns the index of the first unconsumed line.
    fn push_event(
        &self,
        scene: &mut ParsedScene,
        kind: EventKind,
        speaker: Option<String>,
        lines: &[&str],
        at: usize,
    ) -> usize {
        let mut next = at + 1;
        let mut emotion = None;
        if let Some(tag) = lines.get(next).and_then(|l| l.strip_prefix("[emotion:")) {
            emotion = tag
                .strip_suffix(']')
                .map(|e| e.trim().to_string())
                .filter(|e| !e.is_empty());
            next += 1;
        }

        let Some(text_line) = lines.get(next).filter(|l| l.starts_with('"')) else {
            warn!("event marker at line {} has no quoted text line, skipping", at);
            return next;
        };
        let text = text_line.replace('"', "").trim().to_string();

        let character = match (&kind, &speaker) {
            (EventKind::Speak, Some(name)) => match self.characters.get(name) {
                Some(c) => Some(c.clone()),
                None => {
                    warn!("unknown speaker '{}', dropping event", name);
                    return next + 1;
                }
            },
            (EventKind::Narrate, _) => self.characters.get(NARRATOR).cloned(),
            _ => None,
        };

        let order = scene.events.len();
        scene.events.push(StoryEvent {
            id: format!("{}_{}_{}", scene.id, kind.id_tag(), order),
            kind,
            character,
            text,
            emotion,
            order,
        });
        next + 1
    }

    /// Converts a pre-structured scene object into a `ParsedScene`. Character
    /// references are re-resolved by name against the parsed mapping;
    /// `speak` events naming an unknown character are dropped with a warning.
    pub fn resolve_scene(&self, doc: &SceneDoc) -> ParsedScene {
        let mut docs: Vec<&EventDoc> = doc.events.iter().collect();
        docs.sort_by_key(|e| e.order);

        let mut events = Vec::with_capacity(docs.len());
        for event in docs {
            let character = match event.kind {
                EventKind::Speak => {
                    let Some(found) = event
                        .character
                        .as_ref()
                        .and_then(|r| self.characters.get(&r.name))
                    else {
                        warn!(
                            "scene {}: speak event references unknown character {:?}, dropping",
                            doc.id,
                            event.character.as_ref().map(|r| r.name.as_str())
                        );
                        continue;
                    };
                    Some(found.clone())
                }
                EventKind::Narrate => self.characters.get(NARRATOR).cloned(),
                EventKind::Input => None,
            };

            let order = events.len();
            let id = if event.id.is_empty() {
                format!("{}_{}_{}", doc.id, event.kind.id_tag(), order)
            } else {
                event.id.clone()
            };
            events.push(StoryEvent {
                id,
                kind: event.kind,
                character,
                text: event.content.clone(),
                emotion: event.emotion.clone().filter(|e| !e.is_empty()),
                order,
            });
        }

        ParsedScene {
            id: doc.id.clone(),
            name: doc.name.clone(),
            prompt: doc.prompt.clone(),
            mood: doc.mood.clone(),
            time: doc.time.clone(),
            image_url: doc.image_url.clone(),
            events,
        }
    }
}

/// Parses a line-oriented character document. Each `@character:` marker
/// starts a record accumulating `prompt:`, `voice:` and a JSON `personality:`
/// field until the next marker or end of input. Records missing any required
/// field are dropped; malformed personality JSON gets [`Personality::fallback`].
pub fn parse_characters(doc: &str) -> HashMap<String, Arc<Character>> {
    #[derive(Default)]
    struct Partial {
        name: String,
        prompt: Option<String>,
        voice: Option<Voice>,
        personality: Option<Personality>,
    }

    fn finish(partial: Partial, out: &mut HashMap<String, Arc<Character>>) {
        let (Some(prompt), Some(voice)) = (partial.prompt, partial.voice) else {
            warn!("character block '{}' incomplete, skipping", partial.name);
            return;
        };
        out.insert(
            partial.name.clone(),
            Arc::new(Character {
                name: partial.name,
                prompt,
                voice,
                personality: partial.personality.unwrap_or_else(Personality::fallback),
            }),
        );
    }

    let mut characters = HashMap::new();
    let mut current: Option<Partial> = None;

    for line in doc.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some(name) = line.strip_prefix(CHARACTER_MARKER) {
            if let Some(prev) = current.take() {
                finish(prev, &mut characters);
            }
            current = Some(Partial {
                name: name.trim().to_string(),
                ..Default::default()
            });
        } else if let Some(partial) = current.as_mut() {
            if let Some(prompt) = line.strip_prefix("prompt:") {
                partial.prompt = Some(prompt.trim().to_string());
            } else if let Some(voice) = line.strip_prefix("voice:") {
                match voice.parse::<Voice>() {
                    Ok(v) => partial.voice = Some(v),
                    Err(e) => warn!("character '{}': {}", partial.name, e),
                }
            } else if let Some(personality) = line.strip_prefix("personality:") {
                partial.personality = match serde_json::from_str(personality.trim()) {
                    Ok(p) => Some(p),
                    Err(e) => {
                        warn!(
                            "character '{}': bad personality JSON ({}), using fallback",
                            partial.name, e
                        );
                        Some(Personality::fallback())
                    }
                };
            }
        }
    }
    if let Some(prev) = current.take() {
        finish(prev, &mut characters);
    }
    characters
}
