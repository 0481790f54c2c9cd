//! Zustand der Bedienoberfläche
//!
//! Vier Buttons (Start, Call, Answer, Hangup), das Call-ID-Feld und die
//! beiden Video-Flächen. Die Freigaben folgen dem Call-Status.

use crate::media::MediaStream;

#[derive(Debug, Clone)]
pub struct ControlPanel {
    /// Kamera/Mikrofon starten
    pub start: bool,
    /// Call erstellen
    pub call: bool,
    /// Call beitreten
    pub answer: bool,
    /// Auflegen
    pub hangup: bool,
    /// Call-ID (Anzeige beim Anrufer, Eingabe beim Angerufenen)
    pub call_input: String,
    pub local_video: Option<MediaStream>,
    pub remote_video: Option<MediaStream>,
}

impl ControlPanel {
    /// Ausgangszustand: nur Start ist freigegeben
    pub fn initial() -> Self {
        Self {
            start: true,
            call: false,
            answer: false,
            hangup: false,
            call_input: String::new(),
            local_video: None,
            remote_video: None,
        }
    }

    /// Medien laufen: Call/Answer frei, Start gesperrt
    pub fn media_ready(&mut self, local: MediaStream, remote: MediaStream) {
        self.local_video = Some(local);
        self.remote_video = Some(remote);
        self.start = false;
        self.call = true;
        self.answer = true;
    }

    /// Call läuft: nur Hangup frei
    pub fn in_call(&mut self) {
        self.start = false;
        self.call = false;
        self.answer = false;
        self.hangup = true;
    }

    /// Nach dem Auflegen; leert auch die Video-Flächen
    pub fn reset(&mut self) {
        let call_input = std::mem::take(&mut self.call_input);
        *self = Self::initial();
        self.call_input = call_input;
    }
}

impl Default for ControlPanel {
    fn default() -> Self {
        Self::initial()
    }
}
